//! Wire message types.
//!
//! Two channels:
//! - **Sum channel** (`fifo1`): supervisor → Sum Worker, one `IntegerVector`
//! - **Command channel** (`fifo2`): supervisor → Command Worker
//!   (`CommandDescriptor` + `IntegerVector`), then Sum Worker → Command Worker
//!   (`AggregateResult`)

use std::fmt;

use super::codec::ProtocolError;

/// Count-prefixed sequence of signed 32-bit integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegerVector(Vec<i32>);

impl IntegerVector {
    pub fn new(values: Vec<i32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[i32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<i32> {
        self.0
    }

    /// Sum with 32-bit wraparound.
    pub fn wrapping_sum(&self) -> i32 {
        wrapping_sum(&self.0)
    }

    /// Product with 32-bit wraparound; the empty product is 1.
    pub fn wrapping_product(&self) -> i32 {
        wrapping_product(&self.0)
    }
}

impl From<Vec<i32>> for IntegerVector {
    fn from(values: Vec<i32>) -> Self {
        Self(values)
    }
}

pub fn wrapping_sum(values: &[i32]) -> i32 {
    values.iter().fold(0i32, |acc, &v| acc.wrapping_add(v))
}

pub fn wrapping_product(values: &[i32]) -> i32 {
    values.iter().fold(1i32, |acc, &v| acc.wrapping_mul(v))
}

/// Length-prefixed tag naming the operation the Command Worker performs.
///
/// The tag travels as raw bytes; whether it names a known [`Command`] is
/// decided by the worker, not the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    tag: String,
}

impl CommandDescriptor {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn into_tag(self) -> String {
        self.tag
    }

    pub fn command(&self) -> Result<Command, ProtocolError> {
        Command::parse(&self.tag)
    }
}

impl From<Command> for CommandDescriptor {
    fn from(command: Command) -> Self {
        Self::new(command.tag())
    }
}

/// Operations the Command Worker knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Multiply,
}

impl Command {
    pub fn parse(tag: &str) -> Result<Self, ProtocolError> {
        match tag {
            "multiply" => Ok(Self::Multiply),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Multiply => "multiply",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Single integer produced by the Sum Worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateResult(pub i32);

impl AggregateResult {
    pub fn value(self) -> i32 {
        self.0
    }
}
