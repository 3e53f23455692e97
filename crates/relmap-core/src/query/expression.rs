//! Expression trees inside a query model.

use relmap_proto::Value;
use serde::Serialize;

use crate::error::Result;
use crate::metadata::PropertyType;

use super::model::{QueryModel, QuerySourceId};

/// The static type of a query source's items.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ItemType {
    /// Instances of an entity type.
    Entity(String),
    /// Groups of entity instances produced by a group join.
    Group(String),
    /// Anything else (scalars, anonymous objects).
    Value,
}

impl ItemType {
    /// The entity type name, if items are entities.
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            ItemType::Entity(name) => Some(name),
            _ => None,
        }
    }
}

/// A reference to a query source from inside an expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    /// Identity of the referenced source.
    pub id: QuerySourceId,
    /// Item type of the referenced source.
    pub item_type: ItemType,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BinaryOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    And,
    Or,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    /// Check if this is a comparison operator.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::LessThan
                | BinaryOp::LessThanOrEqual
                | BinaryOp::GreaterThan
                | BinaryOp::GreaterThanOrEqual
        )
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expression {
    /// Literal value.
    Constant(Value),
    /// Named parameter bound at execution time.
    Parameter(String),
    /// Reference to a query source.
    Source(SourceRef),
    /// Member access: a property or a navigation, resolved against the model.
    Member {
        target: Box<Expression>,
        name: String,
    },
    /// Explicit property access by name.
    Property {
        target: Box<Expression>,
        name: String,
    },
    /// Type conversion.
    Convert {
        operand: Box<Expression>,
        to: PropertyType,
    },
    /// Binary operation.
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// Logical negation.
    Not(Box<Expression>),
    /// `test ? if_true : if_false`.
    Conditional {
        test: Box<Expression>,
        if_true: Box<Expression>,
        if_false: Box<Expression>,
    },
    /// Method call (string helpers and the like).
    MethodCall {
        method: String,
        target: Option<Box<Expression>>,
        arguments: Vec<Expression>,
    },
    /// Object construction with named members.
    New(Vec<(String, Expression)>),
    /// Nested query.
    SubQuery(Box<QueryModel>),
    /// Lambda with named parameters.
    Lambda {
        parameters: Vec<String>,
        body: Box<Expression>,
    },
    /// Invocation of a lambda or delegate.
    Invocation {
        target: Box<Expression>,
        arguments: Vec<Expression>,
    },
    /// Entity type test.
    TypeIs {
        operand: Box<Expression>,
        entity_type: String,
    },
}

impl Expression {
    /// Literal value.
    pub fn constant(value: impl Into<Value>) -> Self {
        Expression::Constant(value.into())
    }

    /// Named parameter.
    pub fn parameter(name: impl Into<String>) -> Self {
        Expression::Parameter(name.into())
    }

    /// Member access on this expression.
    pub fn member(self, name: impl Into<String>) -> Self {
        Expression::Member {
            target: Box::new(self),
            name: name.into(),
        }
    }

    /// Explicit property access on this expression.
    pub fn property(self, name: impl Into<String>) -> Self {
        Expression::Property {
            target: Box::new(self),
            name: name.into(),
        }
    }

    /// Conversion to another type.
    pub fn convert(self, to: PropertyType) -> Self {
        Expression::Convert {
            operand: Box::new(self),
            to,
        }
    }

    /// Binary operation.
    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `self == other`.
    pub fn equal(self, other: Expression) -> Self {
        Self::binary(BinaryOp::Equal, self, other)
    }

    /// `self != other`.
    pub fn not_equal(self, other: Expression) -> Self {
        Self::binary(BinaryOp::NotEqual, self, other)
    }

    /// `self > other`.
    pub fn greater_than(self, other: Expression) -> Self {
        Self::binary(BinaryOp::GreaterThan, self, other)
    }

    /// `self < other`.
    pub fn less_than(self, other: Expression) -> Self {
        Self::binary(BinaryOp::LessThan, self, other)
    }

    /// `self && other`.
    pub fn and(self, other: Expression) -> Self {
        Self::binary(BinaryOp::And, self, other)
    }

    /// `self || other`.
    pub fn or(self, other: Expression) -> Self {
        Self::binary(BinaryOp::Or, self, other)
    }

    /// `!self`.
    pub fn negate(self) -> Self {
        Expression::Not(Box::new(self))
    }

    /// Instance method call on this expression.
    pub fn call(self, method: impl Into<String>, arguments: Vec<Expression>) -> Self {
        Expression::MethodCall {
            method: method.into(),
            target: Some(Box::new(self)),
            arguments,
        }
    }

    /// Object construction.
    pub fn new_object(members: Vec<(&str, Expression)>) -> Self {
        Expression::New(
            members
                .into_iter()
                .map(|(name, e)| (name.to_string(), e))
                .collect(),
        )
    }

    /// Nested query.
    pub fn subquery(model: QueryModel) -> Self {
        Expression::SubQuery(Box::new(model))
    }

    /// The referenced source, if this is a bare source reference.
    pub fn as_source(&self) -> Option<&SourceRef> {
        match self {
            Expression::Source(r) => Some(r),
            _ => None,
        }
    }

    /// `(source, property)` if this is a member or property access on a bare source.
    pub fn as_source_property(&self) -> Option<(&SourceRef, &str)> {
        match self {
            Expression::Member { target, name } | Expression::Property { target, name } => {
                target.as_source().map(|r| (r, name.as_str()))
            }
            _ => None,
        }
    }

    /// Visit direct children. Subquery bodies are not children.
    pub fn for_each_child<'a>(&'a self, f: &mut dyn FnMut(&'a Expression)) {
        match self {
            Expression::Constant(_)
            | Expression::Parameter(_)
            | Expression::Source(_)
            | Expression::SubQuery(_) => {}
            Expression::Member { target, .. } | Expression::Property { target, .. } => f(target),
            Expression::Convert { operand, .. } | Expression::TypeIs { operand, .. } => f(operand),
            Expression::Not(operand) => f(operand),
            Expression::Binary { left, right, .. } => {
                f(left);
                f(right);
            }
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => {
                f(test);
                f(if_true);
                f(if_false);
            }
            Expression::MethodCall {
                target, arguments, ..
            } => {
                if let Some(target) = target {
                    f(target);
                }
                arguments.iter().for_each(|a| f(a));
            }
            Expression::New(members) => members.iter().for_each(|(_, e)| f(e)),
            Expression::Lambda { body, .. } => f(body),
            Expression::Invocation { target, arguments } => {
                f(target);
                arguments.iter().for_each(|a| f(a));
            }
        }
    }

    /// Pre-order walk. The callback returns `false` to skip a node's children.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Expression) -> bool) {
        if f(self) {
            self.for_each_child(&mut |child| child.walk(f));
        }
    }

    /// Rebuild this node with each direct child replaced by `f(child)`.
    pub fn map_children(
        self,
        f: &mut dyn FnMut(Expression) -> Result<Expression>,
    ) -> Result<Expression> {
        fn boxed(
            e: Box<Expression>,
            f: &mut dyn FnMut(Expression) -> Result<Expression>,
        ) -> Result<Box<Expression>> {
            f(*e).map(Box::new)
        }

        Ok(match self {
            e @ (Expression::Constant(_)
            | Expression::Parameter(_)
            | Expression::Source(_)
            | Expression::SubQuery(_)) => e,
            Expression::Member { target, name } => Expression::Member {
                target: boxed(target, f)?,
                name,
            },
            Expression::Property { target, name } => Expression::Property {
                target: boxed(target, f)?,
                name,
            },
            Expression::Convert { operand, to } => Expression::Convert {
                operand: boxed(operand, f)?,
                to,
            },
            Expression::TypeIs {
                operand,
                entity_type,
            } => Expression::TypeIs {
                operand: boxed(operand, f)?,
                entity_type,
            },
            Expression::Not(operand) => Expression::Not(boxed(operand, f)?),
            Expression::Binary { op, left, right } => Expression::Binary {
                op,
                left: boxed(left, f)?,
                right: boxed(right, f)?,
            },
            Expression::Conditional {
                test,
                if_true,
                if_false,
            } => Expression::Conditional {
                test: boxed(test, f)?,
                if_true: boxed(if_true, f)?,
                if_false: boxed(if_false, f)?,
            },
            Expression::MethodCall {
                method,
                target,
                arguments,
            } => Expression::MethodCall {
                method,
                target: target.map(|t| boxed(t, f)).transpose()?,
                arguments: arguments.into_iter().map(&mut *f).collect::<Result<_>>()?,
            },
            Expression::New(members) => Expression::New(
                members
                    .into_iter()
                    .map(|(name, e)| f(e).map(|e| (name, e)))
                    .collect::<Result<_>>()?,
            ),
            Expression::Lambda { parameters, body } => Expression::Lambda {
                parameters,
                body: boxed(body, f)?,
            },
            Expression::Invocation { target, arguments } => Expression::Invocation {
                target: boxed(target, f)?,
                arguments: arguments.into_iter().map(&mut *f).collect::<Result<_>>()?,
            },
        })
    }

    /// Ids of every source referenced in this tree, excluding subquery bodies.
    pub fn referenced_sources(&self) -> Vec<QuerySourceId> {
        let mut ids = Vec::new();
        self.walk(&mut |e| {
            if let Expression::Source(r) = e {
                if !ids.contains(&r.id) {
                    ids.push(r.id);
                }
            }
            true
        });
        ids
    }
}
