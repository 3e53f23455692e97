//! Relational select expression tree.
//!
//! A [`SelectExpression`] is the dialect-independent description of one SQL query:
//! the tables it reads, the columns it projects, and its filter, ordering and paging.
//! The translator builds and merges these; [`super::sql::QuerySqlGenerator`] renders
//! them through a dialect.

use relmap_proto::Value;

use super::expression::BinaryOp;
use super::model::OrderDirection;

/// Join flavor in SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinKind {
    Inner,
    LeftOuter,
    Cross,
}

/// A table-valued item of a FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableExpression {
    /// A mapped table.
    Table {
        name: String,
        schema: Option<String>,
        alias: String,
    },
    /// Literal SQL used as a derived table.
    RawSql { sql: String, alias: String },
    /// A nested select used as a derived table.
    SubQuery {
        select: Box<SelectExpression>,
        alias: String,
    },
}

impl TableExpression {
    /// Alias the rest of the query refers to this table by.
    pub fn alias(&self) -> &str {
        match self {
            TableExpression::Table { alias, .. }
            | TableExpression::RawSql { alias, .. }
            | TableExpression::SubQuery { alias, .. } => alias,
        }
    }
}

/// A joined table.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinExpression {
    pub kind: SqlJoinKind,
    pub table: TableExpression,
    pub predicate: Option<SqlExpression>,
}

/// A scalar or boolean SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpression {
    /// `alias.column`.
    Column { table: String, column: String },
    /// Inlined literal.
    Literal(Value),
    /// Named parameter.
    Parameter(String),
    /// Binary operator.
    Binary {
        op: BinaryOp,
        left: Box<SqlExpression>,
        right: Box<SqlExpression>,
    },
    /// String concatenation (dialect operator).
    Concat(Box<SqlExpression>, Box<SqlExpression>),
    /// `NOT operand`.
    Not(Box<SqlExpression>),
    /// `operand IS NULL`.
    IsNull(Box<SqlExpression>),
    /// `operand IS NOT NULL`.
    IsNotNull(Box<SqlExpression>),
    /// `CASE WHEN test THEN a ELSE b END`.
    Case {
        test: Box<SqlExpression>,
        if_true: Box<SqlExpression>,
        if_false: Box<SqlExpression>,
    },
    /// `operand LIKE pattern`, with `ESCAPE` when the pattern escapes wildcards.
    Like {
        operand: Box<SqlExpression>,
        pattern: Box<SqlExpression>,
        escape: Option<char>,
    },
    /// Scalar function call.
    Function {
        name: String,
        arguments: Vec<SqlExpression>,
    },
    /// `COUNT(*)`.
    CountAll,
    /// `EXISTS (select)`.
    Exists(Box<SelectExpression>),
    /// Scalar subquery.
    SubQuery(Box<SelectExpression>),
}

impl SqlExpression {
    /// Column reference.
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        SqlExpression::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Binary operation.
    pub fn binary(op: BinaryOp, left: SqlExpression, right: SqlExpression) -> Self {
        SqlExpression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left AND right`.
    pub fn and(left: SqlExpression, right: SqlExpression) -> Self {
        Self::binary(BinaryOp::And, left, right)
    }

    /// Whether this expression yields a truth value rather than a scalar.
    pub fn is_predicate(&self) -> bool {
        match self {
            SqlExpression::Binary { op, .. } => {
                op.is_comparison() || matches!(op, BinaryOp::And | BinaryOp::Or)
            }
            SqlExpression::Not(_)
            | SqlExpression::IsNull(_)
            | SqlExpression::IsNotNull(_)
            | SqlExpression::Like { .. }
            | SqlExpression::Exists(_) => true,
            _ => false,
        }
    }

    /// Turn a boolean scalar into a predicate (`x = 1`); predicates pass through.
    pub fn into_predicate(self) -> Self {
        if self.is_predicate() {
            self
        } else {
            Self::binary(BinaryOp::Equal, self, SqlExpression::Literal(Value::Bool(true)))
        }
    }
}

/// One projected column.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionColumn {
    pub expression: SqlExpression,
    pub alias: Option<String>,
}

/// One ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlOrdering {
    pub expression: SqlExpression,
    pub direction: OrderDirection,
}

/// A relational select.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectExpression {
    /// `SELECT DISTINCT`.
    pub distinct: bool,
    /// Projected columns; rendered as `1` when empty.
    pub projection: Vec<ProjectionColumn>,
    /// Main table.
    pub from: Option<TableExpression>,
    /// Joined tables in order.
    pub joins: Vec<JoinExpression>,
    /// WHERE predicate.
    pub predicate: Option<SqlExpression>,
    /// ORDER BY keys.
    pub order_by: Vec<SqlOrdering>,
    /// Row limit.
    pub limit: Option<u64>,
    /// Rows to skip.
    pub offset: Option<u64>,
    /// Literal SQL sent unchanged; no other clause applies.
    pub verbatim: Option<String>,
}

impl SelectExpression {
    /// Select from one table.
    pub fn new(from: TableExpression) -> Self {
        Self {
            from: Some(from),
            ..Default::default()
        }
    }

    /// A select whose text is sent exactly as given.
    pub fn verbatim(sql: impl Into<String>) -> Self {
        Self {
            verbatim: Some(sql.into()),
            ..Default::default()
        }
    }

    /// Whether further clauses may be composed onto this select.
    pub fn is_composable(&self) -> bool {
        self.verbatim.is_none()
    }

    /// Whether the select can be joined into another one without changing meaning.
    pub fn is_mergeable(&self) -> bool {
        self.is_composable() && !self.distinct && self.limit.is_none() && self.offset.is_none()
    }

    /// Append a projected column; returns its position.
    pub fn add_column(&mut self, expression: SqlExpression) -> usize {
        self.projection.push(ProjectionColumn {
            expression,
            alias: None,
        });
        self.projection.len() - 1
    }

    /// AND a predicate onto the WHERE clause.
    pub fn add_predicate(&mut self, predicate: SqlExpression) {
        let predicate = predicate.into_predicate();
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => SqlExpression::and(existing, predicate),
            None => predicate,
        });
    }

    /// Make `orderings` the primary sort, demoting existing keys to tie-breakers.
    pub fn prepend_orderings(&mut self, orderings: Vec<SqlOrdering>) {
        let existing = std::mem::take(&mut self.order_by);
        self.order_by = orderings;
        for ordering in existing {
            if !self.order_by.iter().any(|o| o.expression == ordering.expression) {
                self.order_by.push(ordering);
            }
        }
    }

    /// Apply a `Take`: the tighter limit wins.
    pub fn apply_limit(&mut self, limit: u64) {
        self.limit = Some(self.limit.map_or(limit, |l| l.min(limit)));
    }

    /// Apply a `Skip` (before any limit is set).
    pub fn apply_offset(&mut self, offset: u64) {
        self.offset = Some(self.offset.unwrap_or(0) + offset);
    }

    /// Join another select into this one.
    ///
    /// The inner select's tables, predicate, ordering and projection are appended.
    /// Returns the reader offset of the inner projection within the merged row.
    pub fn merge_join(
        &mut self,
        inner: SelectExpression,
        kind: SqlJoinKind,
        on: Option<SqlExpression>,
    ) -> usize {
        let offset = self.projection.len();
        let SelectExpression {
            projection,
            from,
            joins,
            predicate,
            order_by,
            ..
        } = inner;

        let mut on = on;
        if let Some(table) = from {
            let inner_filter = match kind {
                SqlJoinKind::LeftOuter => predicate.clone(),
                SqlJoinKind::Inner | SqlJoinKind::Cross => None,
            };
            if let Some(filter) = inner_filter {
                on = Some(match on {
                    Some(on) => SqlExpression::and(on, filter.into_predicate()),
                    None => filter.into_predicate(),
                });
            }
            let kind = match (kind, &on) {
                (SqlJoinKind::Cross, Some(_)) => SqlJoinKind::Inner,
                (kind, _) => kind,
            };
            self.joins.push(JoinExpression {
                kind,
                table,
                predicate: on,
            });
        }
        self.joins.extend(joins);
        if kind != SqlJoinKind::LeftOuter {
            if let Some(predicate) = predicate {
                self.add_predicate(predicate);
            }
        }
        self.order_by.extend(order_by);
        self.projection.extend(projection);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, alias: &str) -> TableExpression {
        TableExpression::Table {
            name: name.into(),
            schema: None,
            alias: alias.into(),
        }
    }

    #[test]
    fn test_merge_join_reports_reader_offset() {
        let mut outer = SelectExpression::new(table("Customers", "c"));
        outer.add_column(SqlExpression::column("c", "CustomerID"));
        outer.add_column(SqlExpression::column("c", "City"));

        let mut inner = SelectExpression::new(table("Orders", "o"));
        inner.add_column(SqlExpression::column("o", "OrderID"));
        inner.add_predicate(SqlExpression::binary(
            BinaryOp::GreaterThan,
            SqlExpression::column("o", "OrderID"),
            SqlExpression::Literal(Value::Int32(10)),
        ));

        let on = SqlExpression::binary(
            BinaryOp::Equal,
            SqlExpression::column("c", "CustomerID"),
            SqlExpression::column("o", "CustomerID"),
        );
        let offset = outer.merge_join(inner, SqlJoinKind::Inner, Some(on));

        assert_eq!(offset, 2);
        assert_eq!(outer.projection.len(), 3);
        assert_eq!(outer.joins.len(), 1);
        assert!(outer.predicate.is_some());
    }

    #[test]
    fn test_left_join_keeps_inner_filter_in_on_clause() {
        let mut outer = SelectExpression::new(table("Customers", "c"));
        let mut inner = SelectExpression::new(table("Orders", "o"));
        inner.add_predicate(SqlExpression::IsNotNull(Box::new(SqlExpression::column(
            "o", "ShipCity",
        ))));

        outer.merge_join(inner, SqlJoinKind::LeftOuter, None);

        assert!(outer.predicate.is_none());
        assert!(outer.joins[0].predicate.is_some());
    }

    #[test]
    fn test_orderings_and_paging() {
        let mut select = SelectExpression::new(table("Customers", "c"));
        let city = SqlOrdering {
            expression: SqlExpression::column("c", "City"),
            direction: OrderDirection::Asc,
        };
        let id = SqlOrdering {
            expression: SqlExpression::column("c", "CustomerID"),
            direction: OrderDirection::Desc,
        };
        select.prepend_orderings(vec![city.clone()]);
        select.prepend_orderings(vec![id.clone()]);
        assert_eq!(select.order_by, vec![id, city]);

        select.apply_limit(10);
        select.apply_limit(3);
        assert_eq!(select.limit, Some(3));
        assert!(!select.is_mergeable());
        assert!(!SelectExpression::verbatim("EXEC GetCustomers").is_composable());
    }
}
