/// Literal records of the operations that were applied to a profile
///
/// Each record renders as one step statement, e.g. `dewow(5)` or
/// `topo_correct('topo.csv' comma)`, which can be parsed back and re-run.
use serde::{Deserialize, Serialize};

use crate::error::{GprError, Result};
use crate::tools;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    /// A quoted string, e.g. a filepath
    Str(String),
    /// An unquoted word, e.g. a delimiter name
    Word(String),
}

impl Value {
    fn parse(token: &str) -> Result<Self> {
        if let Some(quoted) = token.strip_prefix('\'') {
            let inner = quoted.strip_suffix('\'').ok_or_else(|| {
                GprError::Parse(format!("Quoted argument is not terminated: {token}"))
            })?;
            return Ok(Value::Str(unescape(inner)));
        };

        Ok(match token {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(v) = token.parse::<i64>() {
                    Value::Int(v)
                } else if let Ok(v) = token.parse::<f64>() {
                    Value::Float(v)
                } else {
                    Value::Word(token.to_string())
                }
            }
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            Value::Int(v) => usize::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Word(s) => Some(s),
            _ => None,
        }
    }
}

fn unescape(string: &str) -> String {
    let mut output = String::with_capacity(string.len());
    let mut chars = string.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('t') => output.push('\t'),
                Some(escaped) => output.push(escaped),
                None => (),
            },
            c => output.push(c),
        }
    }
    output
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Debug formatting keeps the decimal point and round-trips exactly
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::Word(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub key: Option<String>,
    pub value: Value,
}

/// One applied operation: its name and its literal (resolved) parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub name: String,
    pub arguments: Vec<Argument>,
}

impl OperationRecord {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: Vec::new(),
        }
    }

    /// Add a positional argument
    pub fn arg(mut self, value: Value) -> Self {
        self.arguments.push(Argument { key: None, value });
        self
    }

    /// Add a keyword argument
    pub fn kwarg(mut self, key: &str, value: Value) -> Self {
        self.arguments.push(Argument {
            key: Some(key.to_string()),
            value,
        });
        self
    }

    /// Parse a rendered step statement back into a record
    pub fn parse(statement: &str) -> Result<Self> {
        let (name, tokens) = tools::parse_statement(statement).map_err(GprError::Parse)?;

        let mut record = OperationRecord::new(&name);
        for token in tokens {
            // A keyword is only recognized before any quote, so 'a=b' stays a string
            let key_split = match token.split_once('=') {
                Some((key, value)) if !key.contains('\'') && !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => None,
            };
            record = match key_split {
                Some((key, value)) => record.kwarg(&key, Value::parse(&value)?),
                None => record.arg(Value::parse(&token)?),
            };
        }
        Ok(record)
    }

    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.arguments
            .iter()
            .filter(|a| a.key.is_none())
            .nth(index)
            .map(|a| &a.value)
    }

    pub fn keyword(&self, key: &str) -> Option<&Value> {
        self.arguments
            .iter()
            .find(|a| a.key.as_deref() == Some(key))
            .map(|a| &a.value)
    }
}

impl std::fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arguments = self
            .arguments
            .iter()
            .map(|a| match &a.key {
                Some(key) => format!("{}={}", key, a.value),
                None => a.value.to_string(),
            })
            .collect::<Vec<String>>();
        write!(f, "{}({})", self.name, arguments.join(" "))
    }
}
