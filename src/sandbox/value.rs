// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use serde_json::Value as JsonValue;

use crate::sandbox::parser::FuncBody;

/// Table key: integers sort before strings, both sort within their kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Int(i64),
    Str(String),
}

#[derive(Debug, Default)]
pub struct Table {
    pub map: BTreeMap<Key, Value>,
}

impl Table {
    /// Length in the array sense: consecutive integer keys from 1.
    pub fn seq_len(&self) -> i64 {
        let mut n = 0;
        while self.map.contains_key(&Key::Int(n + 1)) {
            n += 1;
        }
        n
    }
}

/// Variable scope chain. Assignment to an undeclared name lands in the
/// root scope; `local` declares in the current one.
#[derive(Debug, Default)]
pub struct Scope {
    pub vars: std::collections::HashMap<String, Value>,
    pub parent: Option<Rc<RefCell<Scope>>>,
}

impl Scope {
    pub fn child(parent: &Rc<RefCell<Scope>>) -> Rc<RefCell<Scope>> {
        Rc::new(RefCell::new(Scope {
            vars: std::collections::HashMap::new(),
            parent: Some(Rc::clone(parent)),
        }))
    }

    pub fn get(scope: &Rc<RefCell<Scope>>, name: &str) -> Option<Value> {
        let mut cur = Rc::clone(scope);
        loop {
            if let Some(v) = cur.borrow().vars.get(name) {
                return Some(v.clone());
            }
            let parent = cur.borrow().parent.clone();
            match parent {
                Some(p) => cur = p,
                None => return None,
            }
        }
    }

    /// Updates the nearest declaration of `name`, or defines it at the
    /// root when none exists.
    pub fn set(scope: &Rc<RefCell<Scope>>, name: &str, value: Value) {
        let mut cur = Rc::clone(scope);
        loop {
            if cur.borrow().vars.contains_key(name) {
                cur.borrow_mut().vars.insert(name.to_string(), value);
                return;
            }
            let parent = cur.borrow().parent.clone();
            match parent {
                Some(p) => cur = p,
                None => {
                    cur.borrow_mut().vars.insert(name.to_string(), value);
                    return;
                },
            }
        }
    }

    pub fn declare(scope: &Rc<RefCell<Scope>>, name: &str, value: Value) {
        scope.borrow_mut().vars.insert(name.to_string(), value);
    }
}

/// A user-defined function together with its defining scope.
#[derive(Debug)]
pub struct Closure {
    pub body: Rc<FuncBody>,
    pub env: Rc<RefCell<Scope>>,
}

/// Runtime value of the handler language.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Num(f64),
    Str(Rc<str>),
    Table(Rc<RefCell<Table>>),
    Func(Rc<Closure>),
    /// Built-in function, dispatched by name.
    Native(&'static str),
}

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn new_table() -> Value {
        Value::Table(Rc::new(RefCell::new(Table::default())))
    }

    pub fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Num(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Func(_) | Value::Native(_) => "function",
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Display form: integral numbers print without a decimal point.
    pub fn display(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => fmt_num(*n),
            Value::Str(s) => s.to_string(),
            Value::Table(_) => "table".to_string(),
            Value::Func(_) | Value::Native(_) => "function".to_string(),
        }
    }

    pub fn raw_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_key(&self) -> Option<Key> {
        match self {
            Value::Num(n) if n.fract() == 0.0 => Some(Key::Int(*n as i64)),
            Value::Str(s) => Some(Key::Str(s.to_string())),
            _ => None,
        }
    }
}

pub fn fmt_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// Table/value conversion for the `json` builtin and the request handle.
pub fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Nil => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Num(n) => serde_json::Number::from_f64(*n)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Str(s) => JsonValue::String(s.to_string()),
        Value::Table(t) => {
            let t = t.borrow();
            let len = t.seq_len();
            let is_array = len > 0 && t.map.len() as i64 == len;
            if is_array {
                JsonValue::Array(
                    (1..=len)
                        .map(|i| {
                            to_json(t.map.get(&Key::Int(i)).unwrap_or(&Value::Nil))
                        })
                        .collect(),
                )
            } else {
                let mut obj = serde_json::Map::new();
                for (k, v) in &t.map {
                    let key = match k {
                        Key::Int(i) => i.to_string(),
                        Key::Str(s) => s.clone(),
                    };
                    obj.insert(key, to_json(v));
                }
                JsonValue::Object(obj)
            }
        },
        Value::Func(_) | Value::Native(_) => JsonValue::Null,
    }
}

pub fn from_json(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Num(n.as_f64().unwrap_or(0.0)),
        JsonValue::String(s) => Value::str(s.as_str()),
        JsonValue::Array(items) => {
            let mut table = Table::default();
            for (i, item) in items.iter().enumerate() {
                table.map.insert(Key::Int(i as i64 + 1), from_json(item));
            }
            Value::Table(Rc::new(RefCell::new(table)))
        },
        JsonValue::Object(obj) => {
            let mut table = Table::default();
            for (k, v) in obj {
                table.map.insert(Key::Str(k.clone()), from_json(v));
            }
            Value::Table(Rc::new(RefCell::new(table)))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Nil.truthy());
        assert!(!Value::Bool(false).truthy());
        assert!(Value::Num(0.0).truthy());
        assert!(Value::str("").truthy());
    }

    #[test]
    fn test_num_display_trims_integral() {
        assert_eq!(fmt_num(3.0), "3");
        assert_eq!(fmt_num(3.5), "3.5");
        assert_eq!(fmt_num(-0.0), "0");
    }

    #[test]
    fn test_json_round_trip_array_and_object() {
        let json: JsonValue =
            serde_json::from_str(r#"{"items":[1,2,3],"name":"x"}"#).expect("json");
        let value = from_json(&json);
        assert_eq!(to_json(&value), json);
    }
}
