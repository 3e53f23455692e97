//! SQL text generation for select expressions.

use std::fmt::Write as _;

use relmap_proto::Value;

use crate::dialect::SqlDialect;

use super::expression::BinaryOp;
use super::model::OrderDirection;
use super::select::{JoinExpression, SelectExpression, SqlExpression, SqlJoinKind, TableExpression};

/// Generated query text plus the parameters it references, in first-use order.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedSql {
    pub text: String,
    pub parameters: Vec<String>,
}

/// Renders a [`SelectExpression`] through a dialect.
pub struct QuerySqlGenerator<'d> {
    dialect: &'d dyn SqlDialect,
    sql: String,
    parameters: Vec<String>,
    depth: usize,
}

impl<'d> QuerySqlGenerator<'d> {
    /// Create a generator for one statement.
    pub fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            parameters: Vec::new(),
            depth: 0,
        }
    }

    /// Render the select.
    pub fn generate(mut self, select: &SelectExpression) -> GeneratedSql {
        self.visit_select(select);
        GeneratedSql {
            text: self.sql,
            parameters: self.parameters,
        }
    }

    fn newline(&mut self) {
        self.sql.push('\n');
        for _ in 0..self.depth {
            self.sql.push_str("    ");
        }
    }

    fn visit_select(&mut self, select: &SelectExpression) {
        if let Some(text) = &select.verbatim {
            self.sql.push_str(text);
            return;
        }

        self.sql.push_str("SELECT ");
        if select.distinct {
            self.sql.push_str("DISTINCT ");
        }
        if let Some(top) = self.dialect.generate_top(select) {
            self.sql.push_str(&top);
        }

        if select.projection.is_empty() {
            self.sql.push('1');
        }
        for (i, column) in select.projection.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(", ");
            }
            self.visit_projected(&column.expression);
            if let Some(alias) = &column.alias {
                let _ = write!(self.sql, " AS {}", self.dialect.delimit_identifier(alias));
            }
        }

        if let Some(from) = &select.from {
            self.newline();
            self.sql.push_str("FROM ");
            self.visit_table(from);
        }
        for join in &select.joins {
            self.newline();
            self.visit_join(join);
        }

        if let Some(predicate) = &select.predicate {
            self.newline();
            self.sql.push_str("WHERE ");
            self.visit(predicate, 0);
        }

        if !select.order_by.is_empty() {
            self.newline();
            self.sql.push_str("ORDER BY ");
            for (i, ordering) in select.order_by.iter().enumerate() {
                if i > 0 {
                    self.sql.push_str(", ");
                }
                self.visit_projected(&ordering.expression);
                if ordering.direction == OrderDirection::Desc {
                    self.sql.push_str(" DESC");
                }
            }
        }

        let mut paging = String::new();
        self.dialect.generate_limit_offset(&mut paging, select);
        let indent = format!("\n{}", "    ".repeat(self.depth));
        self.sql.push_str(&paging.replace('\n', &indent));
    }

    fn visit_table(&mut self, table: &TableExpression) {
        match table {
            TableExpression::Table {
                name,
                schema,
                alias,
            } => {
                let _ = write!(
                    self.sql,
                    "{} AS {}",
                    self.dialect.delimit_table(name, schema.as_deref()),
                    self.dialect.delimit_identifier(alias)
                );
            }
            TableExpression::RawSql { sql, alias } => {
                self.sql.push('(');
                self.depth += 1;
                self.newline();
                let indent = format!("\n{}", "    ".repeat(self.depth));
                self.sql.push_str(&sql.trim().replace('\n', &indent));
                self.depth -= 1;
                self.newline();
                let _ = write!(self.sql, ") AS {}", self.dialect.delimit_identifier(alias));
            }
            TableExpression::SubQuery { select, alias } => {
                self.visit_nested(select);
                let _ = write!(self.sql, " AS {}", self.dialect.delimit_identifier(alias));
            }
        }
    }

    fn visit_join(&mut self, join: &JoinExpression) {
        let keyword = match (join.kind, &join.predicate) {
            (SqlJoinKind::Inner, _) => "INNER JOIN ",
            (SqlJoinKind::LeftOuter, _) => "LEFT JOIN ",
            (SqlJoinKind::Cross, _) => "CROSS JOIN ",
        };
        self.sql.push_str(keyword);
        self.visit_table(&join.table);
        match &join.predicate {
            Some(predicate) => {
                self.sql.push_str(" ON ");
                self.visit(predicate, 0);
            }
            None if join.kind != SqlJoinKind::Cross => self.sql.push_str(" ON 1 = 1"),
            None => {}
        }
    }

    fn visit_nested(&mut self, select: &SelectExpression) {
        self.sql.push('(');
        self.depth += 1;
        self.newline();
        self.visit_select(select);
        self.depth -= 1;
        self.newline();
        self.sql.push(')');
    }

    /// Projection and ordering positions need scalars: predicates become `CASE`.
    fn visit_projected(&mut self, expression: &SqlExpression) {
        if expression.is_predicate() {
            self.sql.push_str("CASE WHEN ");
            self.visit(expression, 0);
            self.sql.push_str(" THEN 1 ELSE 0 END");
        } else {
            self.visit(expression, 0);
        }
    }

    fn visit(&mut self, expression: &SqlExpression, parent_precedence: u8) {
        match expression {
            SqlExpression::Column { table, column } => {
                let _ = write!(
                    self.sql,
                    "{}.{}",
                    self.dialect.delimit_identifier(table),
                    self.dialect.delimit_identifier(column)
                );
            }
            SqlExpression::Literal(value) => self.sql.push_str(&self.dialect.literal(value)),
            SqlExpression::Parameter(name) => {
                if !self.parameters.contains(name) {
                    self.parameters.push(name.clone());
                }
                self.sql.push_str(&self.dialect.parameter(name));
            }
            SqlExpression::Binary { op, left, right } => {
                let precedence = precedence(*op);
                let parenthesize = precedence < parent_precedence;
                if parenthesize {
                    self.sql.push('(');
                }
                self.visit(left, precedence);
                let _ = write!(self.sql, " {} ", operator(*op));
                // Right operands of non-associative operators bind tighter.
                let right_precedence = match op {
                    BinaryOp::Subtract | BinaryOp::Divide => precedence + 1,
                    _ => precedence,
                };
                self.visit(right, right_precedence);
                if parenthesize {
                    self.sql.push(')');
                }
            }
            SqlExpression::Concat(left, right) => {
                let precedence = 4;
                let parenthesize = precedence < parent_precedence;
                if parenthesize {
                    self.sql.push('(');
                }
                self.visit(left, precedence);
                let _ = write!(self.sql, " {} ", self.dialect.concat_operator());
                self.visit(right, precedence);
                if parenthesize {
                    self.sql.push(')');
                }
            }
            SqlExpression::Not(operand) => {
                self.sql.push_str("NOT (");
                self.visit(operand, 0);
                self.sql.push(')');
            }
            SqlExpression::IsNull(operand) => {
                self.visit(operand, 5);
                self.sql.push_str(" IS NULL");
            }
            SqlExpression::IsNotNull(operand) => {
                self.visit(operand, 5);
                self.sql.push_str(" IS NOT NULL");
            }
            SqlExpression::Case {
                test,
                if_true,
                if_false,
            } => {
                self.sql.push_str("CASE WHEN ");
                self.visit(test, 0);
                self.sql.push_str(" THEN ");
                self.visit_projected(if_true);
                self.sql.push_str(" ELSE ");
                self.visit_projected(if_false);
                self.sql.push_str(" END");
            }
            SqlExpression::Like {
                operand,
                pattern,
                escape,
            } => {
                self.visit(operand, 3);
                self.sql.push_str(" LIKE ");
                self.visit(pattern, 3);
                if let Some(escape) = escape {
                    self.sql.push_str(" ESCAPE ");
                    self.sql
                        .push_str(&self.dialect.literal(&Value::String(escape.to_string())));
                }
            }
            SqlExpression::Function { name, arguments } => {
                self.sql.push_str(name);
                self.sql.push('(');
                for (i, argument) in arguments.iter().enumerate() {
                    if i > 0 {
                        self.sql.push_str(", ");
                    }
                    self.visit(argument, 0);
                }
                self.sql.push(')');
            }
            SqlExpression::CountAll => self.sql.push_str("COUNT(*)"),
            SqlExpression::Exists(select) => {
                self.sql.push_str("EXISTS ");
                self.visit_nested(select);
            }
            SqlExpression::SubQuery(select) => self.visit_nested(select),
        }
    }
}

fn precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Equal
        | BinaryOp::NotEqual
        | BinaryOp::LessThan
        | BinaryOp::LessThanOrEqual
        | BinaryOp::GreaterThan
        | BinaryOp::GreaterThanOrEqual => 3,
        BinaryOp::Add | BinaryOp::Subtract => 4,
        BinaryOp::Multiply | BinaryOp::Divide => 5,
    }
}

fn operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Equal => "=",
        BinaryOp::NotEqual => "<>",
        BinaryOp::LessThan => "<",
        BinaryOp::LessThanOrEqual => "<=",
        BinaryOp::GreaterThan => ">",
        BinaryOp::GreaterThanOrEqual => ">=",
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Add => "+",
        BinaryOp::Subtract => "-",
        BinaryOp::Multiply => "*",
        BinaryOp::Divide => "/",
    }
}
