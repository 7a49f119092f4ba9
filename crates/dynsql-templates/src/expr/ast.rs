//! Expression syntax tree

use dynsql_core::Value;
use std::fmt;

/// A node of a parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: Function,
        args: Vec<Expr>,
    },
}

/// A property path: `user.address.city`, `ids[0]`, `row[key]`
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub root: String,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
        }
    }
}

/// The closed set of callable functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    IsEmpty,
    IsNotEmpty,
    IsBlank,
    IsNotBlank,
    Size,
    Length,
    Contains,
}

impl Function {
    /// Look up an allow-listed function by name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "isEmpty" => Some(Function::IsEmpty),
            "isNotEmpty" => Some(Function::IsNotEmpty),
            "isBlank" => Some(Function::IsBlank),
            "isNotBlank" => Some(Function::IsNotBlank),
            "size" => Some(Function::Size),
            "length" => Some(Function::Length),
            "contains" => Some(Function::Contains),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::IsEmpty => "isEmpty",
            Function::IsNotEmpty => "isNotEmpty",
            Function::IsBlank => "isBlank",
            Function::IsNotBlank => "isNotBlank",
            Function::Size => "size",
            Function::Length => "length",
            Function::Contains => "contains",
        }
    }

    /// Number of arguments, counting the receiver of method syntax
    pub fn arity(&self) -> usize {
        match self {
            Function::Contains => 2,
            _ => 1,
        }
    }
}

impl Expr {
    /// Collect the root names of every path in this expression
    pub fn collect_roots<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(path) => {
                out.push(&path.root);
                for segment in &path.segments {
                    if let Segment::Index(index) = segment {
                        index.collect_roots(out);
                    }
                }
            }
            Expr::Unary { operand, .. } => operand.collect_roots(out),
            Expr::Binary { left, right, .. } => {
                left.collect_roots(out);
                right.collect_roots(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_roots(out);
                }
            }
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::String(s)) => write!(f, "'{}'", s),
            Expr::Literal(value) => write!(f, "{}", value),
            Expr::Path(path) => write!(f, "{}", path),
            Expr::Unary { op: UnaryOp::Not, operand } => write!(f, "!{}", operand),
            Expr::Unary { op: UnaryOp::Neg, operand } => write!(f, "-{}", operand),
            Expr::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.symbol(), right)
            }
            Expr::Call { function, args } => {
                write!(f, "{}(", function.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}
