//! The embedded expression language.
//!
//! Machines are append-only logs of expressions; this module owns the value
//! model and the evaluator that folds those logs into a [`State`]. The daemon
//! core treats [`State`] as an opaque value with a pure transition function:
//! it clones states to stage work and commits or discards whole clones.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

mod parser;

pub use parser::parse;

/// Errors produced while parsing or evaluating expressions.
///
/// These are client errors: an input the machine's evaluator rejects never
/// reaches the log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("unbound symbol `{0}`")]
    Unbound(String),
    #[error("`{0}` is not callable")]
    NotCallable(String),
    #[error("`{name}` expects {expected}, got {got} argument(s)")]
    WrongArity {
        name: String,
        expected: String,
        got: usize,
    },
    #[error("type mismatch in `{name}`: expected {expected}")]
    TypeMismatch {
        name: &'static str,
        expected: &'static str,
    },
    #[error("cannot evaluate an empty application")]
    EmptyApplication,
    #[error("cannot interpret {0} as an expression")]
    UnsupportedJson(String),
}

/// A value of the machine language.
///
/// `Primop` is a name into the builtin table; `Fn` is a user closure. Both
/// print as source text, like every other value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Num(i64),
    Bool(bool),
    Text(String),
    Symbol(String),
    List(Vec<Value>),
    Primop(&'static str),
    Fn(Closure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    params: Vec<String>,
    body: Vec<Value>,
    env: Env,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{}", n),
            Value::Bool(true) => write!(f, "#t"),
            Value::Bool(false) => write!(f, "#f"),
            Value::Text(s) => {
                write!(f, "\"")?;
                for c in s.chars() {
                    match c {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                write!(f, "\"")
            }
            Value::Symbol(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Primop(name) => write!(f, "{}", name),
            Value::Fn(c) => {
                write!(f, "(lambda ({})", c.params.join(" "))?;
                for expr in &c.body {
                    write!(f, " {}", expr)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Value {
    /// Decodes a JSON payload slot into a value.
    ///
    /// Numbers, booleans and arrays map structurally; strings carry source
    /// text and are parsed, so `"(+ 1 2)"` is an application and `"\"hi\""`
    /// a text literal. Objects and `null` have no reading.
    pub fn from_json(j: &serde_json::Value) -> Result<Self, EvalError> {
        match j {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Num)
                .ok_or_else(|| EvalError::UnsupportedJson(n.to_string())),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::String(s) => parse(s),
            serde_json::Value::Array(items) => items
                .iter()
                .map(Value::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            other => Err(EvalError::UnsupportedJson(other.to_string())),
        }
    }

    /// Encodes a value into a JSON payload slot, inverse of [`Value::from_json`].
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Num(n) => serde_json::Value::from(*n),
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let j = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&j).map_err(serde::de::Error::custom)
    }
}

const PRIMOPS: &[&str] = &[
    "+", "-", "*", "=", "<", "count", "list", "cons", "first", "rest",
];

/// The binding environment threaded through evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Env {
    vars: HashMap<String, Value>,
}

impl Env {
    fn initial() -> Self {
        let mut env = Env::default();
        for &name in PRIMOPS {
            env.set(name, Value::Primop(name));
        }
        env.set("history", Value::List(Vec::new()));
        env
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn set(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }
}

/// The folded state of one machine.
///
/// `apply` is the transition function: evaluate one input, record it. The
/// `history` binding always holds the inputs applied so far, so machine code
/// can observe its own log (`(count history)`).
#[derive(Debug, Clone)]
pub struct State {
    env: Env,
    applied: Vec<Value>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self {
            env: Env::initial(),
            applied: Vec::new(),
        }
    }

    /// Evaluates one log input against this state.
    ///
    /// On error nothing observable changes for callers that discard the
    /// state, which is how the daemon stages every fold.
    pub fn apply(&mut self, input: &Value) -> Result<Value, EvalError> {
        let result = eval(&mut self.env, input)?;
        self.applied.push(input.clone());
        self.env.set("history", Value::List(self.applied.clone()));
        Ok(result)
    }

    /// Evaluates an expression against a throwaway copy of the environment.
    pub fn query(&self, expr: &Value) -> Result<Value, EvalError> {
        let mut env = self.env.clone();
        eval(&mut env, expr)
    }
}

fn eval(env: &mut Env, expr: &Value) -> Result<Value, EvalError> {
    match expr {
        Value::Num(_) | Value::Bool(_) | Value::Text(_) | Value::Primop(_) | Value::Fn(_) => {
            Ok(expr.clone())
        }
        Value::Symbol(name) => env
            .lookup(name)
            .cloned()
            .ok_or_else(|| EvalError::Unbound(name.clone())),
        Value::List(items) => {
            let (head, rest) = items
                .split_first()
                .ok_or(EvalError::EmptyApplication)?;
            if let Value::Symbol(name) = head {
                match name.as_str() {
                    "quote" => return special_quote(rest),
                    "if" => return special_if(env, rest),
                    "def" => return special_def(env, rest),
                    "lambda" => return special_lambda(env, rest),
                    _ => {}
                }
            }
            let f = eval(env, head)?;
            let args = rest
                .iter()
                .map(|a| eval(env, a))
                .collect::<Result<Vec<_>, _>>()?;
            apply_fn(&f, &args)
        }
    }
}

fn special_quote(args: &[Value]) -> Result<Value, EvalError> {
    match args {
        [v] => Ok(v.clone()),
        _ => Err(wrong_arity("quote", "1", args.len())),
    }
}

fn special_if(env: &mut Env, args: &[Value]) -> Result<Value, EvalError> {
    match args {
        [cond, then, otherwise] => {
            // Only #f is falsy.
            if eval(env, cond)? == Value::Bool(false) {
                eval(env, otherwise)
            } else {
                eval(env, then)
            }
        }
        _ => Err(wrong_arity("if", "3", args.len())),
    }
}

fn special_def(env: &mut Env, args: &[Value]) -> Result<Value, EvalError> {
    match args {
        [Value::Symbol(name), expr] => {
            let value = eval(env, expr)?;
            env.set(name, value.clone());
            Ok(value)
        }
        [_, _] => Err(EvalError::TypeMismatch {
            name: "def",
            expected: "a symbol to bind",
        }),
        _ => Err(wrong_arity("def", "2", args.len())),
    }
}

fn special_lambda(env: &mut Env, args: &[Value]) -> Result<Value, EvalError> {
    let (params, body) = args
        .split_first()
        .ok_or_else(|| wrong_arity("lambda", "at least 2", args.len()))?;
    if body.is_empty() {
        return Err(wrong_arity("lambda", "at least 2", args.len()));
    }
    let Value::List(params) = params else {
        return Err(EvalError::TypeMismatch {
            name: "lambda",
            expected: "a parameter list",
        });
    };
    let params = params
        .iter()
        .map(|p| match p {
            Value::Symbol(s) => Ok(s.clone()),
            _ => Err(EvalError::TypeMismatch {
                name: "lambda",
                expected: "symbols as parameters",
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Fn(Closure {
        params,
        body: body.to_vec(),
        env: env.clone(),
    }))
}

fn apply_fn(f: &Value, args: &[Value]) -> Result<Value, EvalError> {
    match f {
        Value::Primop(name) => run_primop(name, args),
        Value::Fn(closure) => {
            if args.len() != closure.params.len() {
                return Err(wrong_arity(
                    "lambda",
                    &closure.params.len().to_string(),
                    args.len(),
                ));
            }
            let mut local = closure.env.clone();
            for (param, arg) in closure.params.iter().zip(args) {
                local.set(param, arg.clone());
            }
            let mut result = Value::List(Vec::new());
            for expr in &closure.body {
                result = eval(&mut local, expr)?;
            }
            Ok(result)
        }
        other => Err(EvalError::NotCallable(other.to_string())),
    }
}

fn wrong_arity(name: &str, expected: &str, got: usize) -> EvalError {
    EvalError::WrongArity {
        name: name.to_string(),
        expected: expected.to_string(),
        got,
    }
}

fn as_num(name: &'static str, v: &Value) -> Result<i64, EvalError> {
    match v {
        Value::Num(n) => Ok(*n),
        _ => Err(EvalError::TypeMismatch {
            name,
            expected: "numbers",
        }),
    }
}

fn run_primop(name: &'static str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "+" => {
            let mut acc = 0i64;
            for v in args {
                acc = acc.wrapping_add(as_num("+", v)?);
            }
            Ok(Value::Num(acc))
        }
        "*" => {
            let mut acc = 1i64;
            for v in args {
                acc = acc.wrapping_mul(as_num("*", v)?);
            }
            Ok(Value::Num(acc))
        }
        "-" => {
            let (first, rest) = args
                .split_first()
                .ok_or_else(|| wrong_arity("-", "at least 1", 0))?;
            let first = as_num("-", first)?;
            if rest.is_empty() {
                return Ok(Value::Num(first.wrapping_neg()));
            }
            let mut acc = first;
            for v in rest {
                acc = acc.wrapping_sub(as_num("-", v)?);
            }
            Ok(Value::Num(acc))
        }
        "=" => match args {
            [a, b] => Ok(Value::Bool(a == b)),
            _ => Err(wrong_arity("=", "2", args.len())),
        },
        "<" => match args {
            [a, b] => Ok(Value::Bool(as_num("<", a)? < as_num("<", b)?)),
            _ => Err(wrong_arity("<", "2", args.len())),
        },
        "count" => match args {
            [Value::List(items)] => Ok(Value::Num(items.len() as i64)),
            [Value::Text(s)] => Ok(Value::Num(s.chars().count() as i64)),
            [_] => Err(EvalError::TypeMismatch {
                name: "count",
                expected: "a list or string",
            }),
            _ => Err(wrong_arity("count", "1", args.len())),
        },
        "list" => Ok(Value::List(args.to_vec())),
        "cons" => match args {
            [head, Value::List(tail)] => {
                let mut items = Vec::with_capacity(tail.len() + 1);
                items.push(head.clone());
                items.extend(tail.iter().cloned());
                Ok(Value::List(items))
            }
            [_, _] => Err(EvalError::TypeMismatch {
                name: "cons",
                expected: "a list as second argument",
            }),
            _ => Err(wrong_arity("cons", "2", args.len())),
        },
        "first" => match args {
            [Value::List(items)] => items.first().cloned().ok_or(EvalError::TypeMismatch {
                name: "first",
                expected: "a non-empty list",
            }),
            [_] => Err(EvalError::TypeMismatch {
                name: "first",
                expected: "a non-empty list",
            }),
            _ => Err(wrong_arity("first", "1", args.len())),
        },
        "rest" => match args {
            [Value::List(items)] => {
                if items.is_empty() {
                    Err(EvalError::TypeMismatch {
                        name: "rest",
                        expected: "a non-empty list",
                    })
                } else {
                    Ok(Value::List(items[1..].to_vec()))
                }
            }
            [_] => Err(EvalError::TypeMismatch {
                name: "rest",
                expected: "a non-empty list",
            }),
            _ => Err(wrong_arity("rest", "1", args.len())),
        },
        _ => Err(EvalError::Unbound(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &mut State, src: &str) -> Result<Value, EvalError> {
        state.apply(&parse(src).unwrap())
    }

    #[test]
    fn literals_autoquote() {
        let mut state = State::new();
        assert_eq!(run(&mut state, "42").unwrap(), Value::Num(42));
        assert_eq!(run(&mut state, "#t").unwrap(), Value::Bool(true));
        assert_eq!(run(&mut state, r#""hi""#).unwrap(), Value::Text("hi".into()));
    }

    #[test]
    fn arithmetic() {
        let state = State::new();
        let q = |src: &str| state.query(&parse(src).unwrap()).unwrap();
        assert_eq!(q("(+ 1 2)"), Value::Num(3));
        assert_eq!(q("(+ )"), Value::Num(0));
        assert_eq!(q("(- 10 1 2)"), Value::Num(7));
        assert_eq!(q("(- 5)"), Value::Num(-5));
        assert_eq!(q("(* 2 3 4)"), Value::Num(24));
        assert_eq!(q("(< 1 2)"), Value::Bool(true));
        assert_eq!(q("(= (list 1 2) (list 1 2))"), Value::Bool(true));
    }

    #[test]
    fn def_persists_across_inputs() {
        let mut state = State::new();
        run(&mut state, "(def x 40)").unwrap();
        assert_eq!(run(&mut state, "(+ x 2)").unwrap(), Value::Num(42));
    }

    #[test]
    fn lambda_captures_definitions() {
        let mut state = State::new();
        run(&mut state, "(def add2 (lambda (x) (+ x 2)))").unwrap();
        assert_eq!(run(&mut state, "(add2 7)").unwrap(), Value::Num(9));
        assert!(matches!(
            run(&mut state, "(add2 1 2)"),
            Err(EvalError::WrongArity { .. })
        ));
    }

    #[test]
    fn history_tracks_applied_inputs() {
        let mut state = State::new();
        assert_eq!(
            state.query(&parse("(count history)").unwrap()).unwrap(),
            Value::Num(0)
        );
        run(&mut state, "1").unwrap();
        run(&mut state, "2").unwrap();
        run(&mut state, "3").unwrap();
        assert_eq!(
            state.query(&parse("(count history)").unwrap()).unwrap(),
            Value::Num(3)
        );
        assert_eq!(
            state.query(&parse("(first history)").unwrap()).unwrap(),
            Value::Num(1)
        );
    }

    #[test]
    fn query_does_not_mutate() {
        let state = State::new();
        state.query(&parse("(def x 1)").unwrap()).unwrap();
        assert!(matches!(
            state.query(&parse("x").unwrap()),
            Err(EvalError::Unbound(_))
        ));
    }

    #[test]
    fn eval_errors() {
        let state = State::new();
        let q = |src: &str| state.query(&parse(src).unwrap());
        assert!(matches!(q("nope"), Err(EvalError::Unbound(_))));
        assert!(matches!(q("(1 2)"), Err(EvalError::NotCallable(_))));
        assert!(matches!(q("()"), Err(EvalError::EmptyApplication)));
        assert!(matches!(q("(+ 1 #t)"), Err(EvalError::TypeMismatch { .. })));
        assert!(matches!(q("(if #t 1)"), Err(EvalError::WrongArity { .. })));
    }

    #[test]
    fn json_mapping_round_trips() {
        let cases = [
            Value::Num(3),
            Value::Bool(false),
            Value::Text("hi \"there\"".into()),
            Value::Symbol("foo".into()),
            Value::List(vec![Value::Num(1), Value::Text("x".into())]),
        ];
        for v in cases {
            assert_eq!(Value::from_json(&v.to_json()).unwrap(), v);
        }
        // Source text in a JSON string decodes as an expression.
        assert_eq!(
            Value::from_json(&serde_json::json!("(+ 1 2)")).unwrap(),
            parse("(+ 1 2)").unwrap()
        );
        assert!(Value::from_json(&serde_json::json!(null)).is_err());
        assert!(Value::from_json(&serde_json::json!({"a": 1})).is_err());
        assert!(Value::from_json(&serde_json::json!(1.5)).is_err());
    }
}
