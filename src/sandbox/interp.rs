// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
    time::Instant,
};

use rand::RngExt;

use crate::{
    error::{CoreError, CoreResult, SandboxFault},
    sandbox::{
        api::{SandboxInvocation, SandboxRequest, SandboxResponse, SessionSnapshot},
        limits::{OPS_PER_CHECK, SandboxLimits},
        parser::{
            self, BinOp, Block, Expr, ForIter, FuncBody, LValue, Stmt, TableItem,
            UnOp,
        },
        value::{Closure, Key, Scope, Table, Value, fmt_num, from_json, to_json},
    },
};

const MAX_CALL_DEPTH: u32 = 100;

/// Parses and evaluates one handler script against one request.
///
/// Runs on a blocking worker. The deadline and operation budget are
/// checked cooperatively at operation boundaries; the async caller holds
/// the outer wall-clock watchdog.
pub fn run_script(
    source: &str,
    limits: &SandboxLimits,
    request: SandboxRequest,
    session: SessionSnapshot,
) -> CoreResult<SandboxInvocation> {
    let block = parser::parse(source)?;
    let mut interp = Interp::new(limits.clone(), &request, &session);
    let root = Rc::clone(&interp.globals);
    interp.exec_block(&block, &root)?;
    Ok(interp.finish())
}

enum Flow {
    Normal,
    Break,
    Return(Value),
}

fn rt(msg: impl Into<String>) -> CoreError {
    CoreError::sandbox(SandboxFault::Runtime, msg)
}

fn limit(msg: impl Into<String>) -> CoreError {
    CoreError::sandbox(SandboxFault::LimitExceeded, msg)
}

struct Interp {
    limits: SandboxLimits,
    deadline: Instant,
    started: Instant,
    ops: u64,
    depth: u32,
    alloc_bytes: usize,
    response: SandboxResponse,
    explicit_status: bool,
    session: BTreeMap<String, String>,
    session_updates: BTreeMap<String, Option<String>>,
    storage: BTreeMap<String, String>,
    storage_updates: BTreeMap<String, Option<String>>,
    globals: Rc<RefCell<Scope>>,
}

impl Interp {
    fn new(
        limits: SandboxLimits,
        request: &SandboxRequest,
        session: &SessionSnapshot,
    ) -> Self {
        let now = Instant::now();
        let globals = build_globals(request, session);
        Self {
            deadline: now + limits.wall_clock,
            started: now,
            limits,
            ops: 0,
            depth: 0,
            alloc_bytes: 0,
            response: SandboxResponse::default(),
            explicit_status: false,
            session: session.data.clone(),
            session_updates: BTreeMap::new(),
            storage: session.storage.clone(),
            storage_updates: BTreeMap::new(),
            globals,
        }
    }

    fn finish(self) -> SandboxInvocation {
        SandboxInvocation {
            response: self.response,
            session_updates: self.session_updates,
            storage_updates: self.storage_updates,
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Budget accounting

    fn tick(&mut self) -> CoreResult<()> {
        self.ops += 1;
        if self.ops > self.limits.op_budget {
            return Err(limit("operation budget exhausted"));
        }
        if self.ops % OPS_PER_CHECK == 0 && Instant::now() >= self.deadline {
            return Err(CoreError::sandbox(
                SandboxFault::Timeout,
                "deadline exceeded",
            ));
        }
        Ok(())
    }

    fn alloc(&mut self, bytes: usize) -> CoreResult<()> {
        self.alloc_bytes = self.alloc_bytes.saturating_add(bytes);
        if self.alloc_bytes > self.limits.memory_bytes_max {
            return Err(limit("memory limit exceeded"));
        }
        Ok(())
    }

    fn make_str(&mut self, s: String) -> CoreResult<Value> {
        if s.len() > self.limits.string_bytes_max {
            return Err(limit("string length limit exceeded"));
        }
        self.alloc(s.len())?;
        Ok(Value::str(s))
    }

    fn append_output(&mut self, text: &str) -> CoreResult<()> {
        if self.response.body.len() + text.len() > self.limits.output_bytes_max {
            return Err(limit("output limit exceeded"));
        }
        self.response.body.push_str(text);
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Statements

    fn exec_block(
        &mut self,
        block: &Block,
        scope: &Rc<RefCell<Scope>>,
    ) -> CoreResult<Flow> {
        for stmt in &block.0 {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {},
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &Rc<RefCell<Scope>>,
    ) -> CoreResult<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Local(names, exprs) => {
                let mut values = Vec::with_capacity(names.len());
                for e in exprs {
                    values.push(self.eval(e, scope)?);
                }
                for (i, name) in names.iter().enumerate() {
                    let v = values.get(i).cloned().unwrap_or(Value::Nil);
                    Scope::declare(scope, name, v);
                }
                Ok(Flow::Normal)
            },
            Stmt::Assign(LValue::Name(name), expr) => {
                let v = self.eval(expr, scope)?;
                Scope::set(scope, name, v);
                Ok(Flow::Normal)
            },
            Stmt::Assign(LValue::Index(base, key), expr) => {
                let table = self.eval(base, scope)?;
                let key = self.eval(key, scope)?;
                let value = self.eval(expr, scope)?;
                self.table_set(&table, &key, value)?;
                Ok(Flow::Normal)
            },
            Stmt::ExprStat(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            },
            Stmt::If(arms, otherwise) => {
                for (cond, body) in arms {
                    if self.eval(cond, scope)?.truthy() {
                        let child = Scope::child(scope);
                        return self.exec_block(body, &child);
                    }
                }
                if let Some(body) = otherwise {
                    let child = Scope::child(scope);
                    return self.exec_block(body, &child);
                }
                Ok(Flow::Normal)
            },
            Stmt::While(cond, body) => {
                loop {
                    self.tick()?;
                    if !self.eval(cond, scope)?.truthy() {
                        break;
                    }
                    let child = Scope::child(scope);
                    match self.exec_block(body, &child)? {
                        Flow::Normal => {},
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            },
            Stmt::NumericFor {
                var,
                from,
                to,
                step,
                body,
            } => {
                let from = self.num_operand(from, scope)?;
                let to = self.num_operand(to, scope)?;
                let step = match step {
                    Some(e) => self.num_operand(e, scope)?,
                    None => 1.0,
                };
                if step == 0.0 {
                    return Err(rt("for step must not be zero"));
                }
                let mut i = from;
                loop {
                    self.tick()?;
                    let keep_going = if step > 0.0 { i <= to } else { i >= to };
                    if !keep_going {
                        break;
                    }
                    let child = Scope::child(scope);
                    Scope::declare(&child, var, Value::Num(i));
                    match self.exec_block(body, &child)? {
                        Flow::Normal => {},
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                    i += step;
                }
                Ok(Flow::Normal)
            },
            Stmt::GenericFor {
                key,
                value,
                iter,
                body,
            } => {
                let (source, numeric_only) = match iter {
                    ForIter::Pairs(e) => (e, false),
                    ForIter::Ipairs(e) => (e, true),
                };
                let table = match self.eval(source, scope)? {
                    Value::Table(t) => t,
                    other => {
                        return Err(rt(format!(
                            "cannot iterate a {}",
                            other.type_name()
                        )));
                    },
                };
                // Snapshot entries so the body may mutate the table.
                let entries: Vec<(Key, Value)> = if numeric_only {
                    let t = table.borrow();
                    (1..=t.seq_len())
                        .map(|i| {
                            (
                                Key::Int(i),
                                t.map.get(&Key::Int(i)).cloned().unwrap_or(Value::Nil),
                            )
                        })
                        .collect()
                } else {
                    table
                        .borrow()
                        .map
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                };
                for (k, v) in entries {
                    self.tick()?;
                    let child = Scope::child(scope);
                    let key_value = match k {
                        Key::Int(i) => Value::Num(i as f64),
                        Key::Str(s) => Value::str(s),
                    };
                    Scope::declare(&child, key, key_value);
                    if let Some(value_name) = value {
                        Scope::declare(&child, value_name, v);
                    }
                    match self.exec_block(body, &child)? {
                        Flow::Normal => {},
                        Flow::Break => break,
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            },
            Stmt::Return(expr) => {
                let v = match expr {
                    Some(e) => self.eval(e, scope)?,
                    None => Value::Nil,
                };
                Ok(Flow::Return(v))
            },
            Stmt::Break => Ok(Flow::Break),
            Stmt::FunctionDecl(name, body) => {
                let closure = self.closure(body, scope);
                Scope::set(scope, name, closure);
                Ok(Flow::Normal)
            },
            Stmt::LocalFunction(name, body) => {
                // Declared before capture so the body can recurse.
                Scope::declare(scope, name, Value::Nil);
                let closure = self.closure(body, scope);
                Scope::declare(scope, name, closure);
                Ok(Flow::Normal)
            },
        }
    }

    fn closure(&self, body: &Rc<FuncBody>, scope: &Rc<RefCell<Scope>>) -> Value {
        Value::Func(Rc::new(Closure {
            body: Rc::clone(body),
            env: Rc::clone(scope),
        }))
    }

    fn num_operand(
        &mut self,
        expr: &Expr,
        scope: &Rc<RefCell<Scope>>,
    ) -> CoreResult<f64> {
        let v = self.eval(expr, scope)?;
        v.as_num()
            .ok_or_else(|| rt(format!("expected number, got {}", v.type_name())))
    }

    fn table_set(
        &mut self,
        table: &Value,
        key: &Value,
        value: Value,
    ) -> CoreResult<()> {
        let table = match table {
            Value::Table(t) => t,
            other => return Err(rt(format!("cannot index a {}", other.type_name()))),
        };
        let key = key
            .as_key()
            .ok_or_else(|| rt(format!("invalid table key: {}", key.type_name())))?;
        if matches!(value, Value::Nil) {
            table.borrow_mut().map.remove(&key);
        } else {
            self.alloc(32)?;
            table.borrow_mut().map.insert(key, value);
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Expressions

    fn eval(&mut self, expr: &Expr, scope: &Rc<RefCell<Scope>>) -> CoreResult<Value> {
        self.tick()?;
        match expr {
            Expr::Nil => Ok(Value::Nil),
            Expr::True => Ok(Value::Bool(true)),
            Expr::False => Ok(Value::Bool(false)),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::str(s.as_str())),
            Expr::Var(name) => Ok(Scope::get(scope, name).unwrap_or(Value::Nil)),
            Expr::Index(base, key) => {
                let base = self.eval(base, scope)?;
                let key = self.eval(key, scope)?;
                match &base {
                    Value::Table(t) => {
                        let key = key.as_key().ok_or_else(|| {
                            rt(format!("invalid table key: {}", key.type_name()))
                        })?;
                        Ok(t.borrow().map.get(&key).cloned().unwrap_or(Value::Nil))
                    },
                    other => {
                        Err(rt(format!("cannot index a {}", other.type_name())))
                    },
                }
            },
            Expr::Call(f, args) => {
                let callee = self.eval(f, scope)?;
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a, scope)?);
                }
                self.call_value(&callee, values)
            },
            Expr::Func(body) => Ok(self.closure(body, scope)),
            Expr::Table(items) => {
                self.alloc(64)?;
                let table = Rc::new(RefCell::new(Table::default()));
                let mut next_index: i64 = 1;
                for item in items {
                    self.alloc(32)?;
                    match item {
                        TableItem::Positional(e) => {
                            let v = self.eval(e, scope)?;
                            table.borrow_mut().map.insert(Key::Int(next_index), v);
                            next_index += 1;
                        },
                        TableItem::Named(name, e) => {
                            let v = self.eval(e, scope)?;
                            table
                                .borrow_mut()
                                .map
                                .insert(Key::Str(name.clone()), v);
                        },
                        TableItem::Keyed(k, e) => {
                            let kv = self.eval(k, scope)?;
                            let key = kv.as_key().ok_or_else(|| {
                                rt(format!(
                                    "invalid table key: {}",
                                    kv.type_name()
                                ))
                            })?;
                            let v = self.eval(e, scope)?;
                            table.borrow_mut().map.insert(key, v);
                        },
                    }
                }
                Ok(Value::Table(table))
            },
            Expr::Un(op, operand) => {
                let v = self.eval(operand, scope)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnOp::Neg => v
                        .as_num()
                        .map(|n| Value::Num(-n))
                        .ok_or_else(|| {
                            rt(format!("cannot negate a {}", v.type_name()))
                        }),
                    UnOp::Len => match &v {
                        Value::Str(s) => Ok(Value::Num(s.len() as f64)),
                        Value::Table(t) => {
                            Ok(Value::Num(t.borrow().seq_len() as f64))
                        },
                        other => Err(rt(format!(
                            "cannot take length of a {}",
                            other.type_name()
                        ))),
                    },
                }
            },
            Expr::Bin(BinOp::And, lhs, rhs) => {
                let l = self.eval(lhs, scope)?;
                if l.truthy() {
                    self.eval(rhs, scope)
                } else {
                    Ok(l)
                }
            },
            Expr::Bin(BinOp::Or, lhs, rhs) => {
                let l = self.eval(lhs, scope)?;
                if l.truthy() { Ok(l) } else { self.eval(rhs, scope) }
            },
            Expr::Bin(op, lhs, rhs) => {
                let l = self.eval(lhs, scope)?;
                let r = self.eval(rhs, scope)?;
                self.binop(*op, l, r)
            },
        }
    }

    fn binop(&mut self, op: BinOp, l: Value, r: Value) -> CoreResult<Value> {
        match op {
            BinOp::Concat => {
                let ls = self.concat_operand(&l)?;
                let rs = self.concat_operand(&r)?;
                self.make_str(format!("{ls}{rs}"))
            },
            BinOp::Eq => Ok(Value::Bool(l.raw_eq(&r))),
            BinOp::Ne => Ok(Value::Bool(!l.raw_eq(&r))),
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = match (&l, &r) {
                    (Value::Num(a), Value::Num(b)) => a.partial_cmp(b),
                    (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
                    _ => None,
                }
                .ok_or_else(|| {
                    rt(format!(
                        "cannot compare {} with {}",
                        l.type_name(),
                        r.type_name()
                    ))
                })?;
                let pass = match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                };
                Ok(Value::Bool(pass))
            },
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let a = l.as_num().ok_or_else(|| {
                    rt(format!("arithmetic on a {}", l.type_name()))
                })?;
                let b = r.as_num().ok_or_else(|| {
                    rt(format!("arithmetic on a {}", r.type_name()))
                })?;
                let n = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    _ => a - (a / b).floor() * b,
                };
                Ok(Value::Num(n))
            },
            BinOp::And | BinOp::Or => unreachable!("short-circuited in eval"),
        }
    }

    fn concat_operand(&self, v: &Value) -> CoreResult<String> {
        match v {
            Value::Str(s) => Ok(s.to_string()),
            Value::Num(n) => Ok(fmt_num(*n)),
            other => Err(rt(format!("cannot concatenate a {}", other.type_name()))),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Calls

    fn call_value(&mut self, callee: &Value, args: Vec<Value>) -> CoreResult<Value> {
        match callee {
            Value::Func(closure) => {
                self.depth += 1;
                if self.depth > MAX_CALL_DEPTH {
                    self.depth -= 1;
                    return Err(rt("call depth limit exceeded"));
                }
                let scope = Scope::child(&closure.env);
                for (i, param) in closure.body.params.iter().enumerate() {
                    let v = args.get(i).cloned().unwrap_or(Value::Nil);
                    Scope::declare(&scope, param, v);
                }
                let result = self.exec_block(&closure.body.body, &scope);
                self.depth -= 1;
                match result? {
                    Flow::Return(v) => Ok(v),
                    _ => Ok(Value::Nil),
                }
            },
            Value::Native(name) => self.call_native(name, args),
            other => Err(rt(format!("attempt to call a {}", other.type_name()))),
        }
    }

    fn arg(&self, args: &[Value], i: usize) -> Value {
        args.get(i).cloned().unwrap_or(Value::Nil)
    }

    fn str_arg(&self, args: &[Value], i: usize, who: &str) -> CoreResult<String> {
        match self.arg(args, i) {
            Value::Str(s) => Ok(s.to_string()),
            Value::Num(n) => Ok(fmt_num(n)),
            other => Err(rt(format!(
                "{who}: expected string, got {}",
                other.type_name()
            ))),
        }
    }

    fn num_arg(&self, args: &[Value], i: usize, who: &str) -> CoreResult<f64> {
        self.arg(args, i).as_num().ok_or_else(|| {
            rt(format!("{who}: expected number argument {}", i + 1))
        })
    }

    fn call_native(&mut self, name: &str, args: Vec<Value>) -> CoreResult<Value> {
        match name {
            "print" => {
                let line = args
                    .iter()
                    .map(Value::display)
                    .collect::<Vec<_>>()
                    .join("\t");
                self.append_output(&line)?;
                self.append_output("\n")?;
                Ok(Value::Nil)
            },
            "write" | "response.write" | "response.print" => {
                for v in &args {
                    let text = v.display();
                    self.append_output(&text)?;
                }
                if name == "response.print" {
                    self.append_output("\n")?;
                }
                Ok(Value::Nil)
            },
            "tostring" => {
                let v = self.arg(&args, 0);
                self.make_str(v.display())
            },
            "tonumber" => Ok(self
                .arg(&args, 0)
                .as_num()
                .map(Value::Num)
                .unwrap_or(Value::Nil)),
            "type" => Ok(Value::str(self.arg(&args, 0).type_name())),
            "clock" => {
                Ok(Value::Num(self.started.elapsed().as_secs_f64()))
            },

            // string
            "string.len" => {
                let s = self.str_arg(&args, 0, "string.len")?;
                Ok(Value::Num(s.len() as f64))
            },
            "string.sub" => {
                let s = self.str_arg(&args, 0, "string.sub")?;
                let len = s.len() as i64;
                let from = self.num_arg(&args, 1, "string.sub")? as i64;
                let to = match self.arg(&args, 2) {
                    Value::Nil => -1,
                    v => v.as_num().ok_or_else(|| rt("string.sub: bad range"))?
                        as i64,
                };
                let norm = |i: i64| -> i64 {
                    if i < 0 { (len + i + 1).max(0) } else { i }
                };
                let from = norm(from).max(1);
                let to = norm(to).min(len);
                if from > to {
                    return self.make_str(String::new());
                }
                let out: String = s
                    .chars()
                    .skip(from as usize - 1)
                    .take((to - from + 1) as usize)
                    .collect();
                self.make_str(out)
            },
            "string.upper" => {
                let s = self.str_arg(&args, 0, "string.upper")?;
                self.make_str(s.to_uppercase())
            },
            "string.lower" => {
                let s = self.str_arg(&args, 0, "string.lower")?;
                self.make_str(s.to_lowercase())
            },
            "string.find" => {
                let s = self.str_arg(&args, 0, "string.find")?;
                let needle = self.str_arg(&args, 1, "string.find")?;
                Ok(s.find(&needle)
                    .map(|i| Value::Num(i as f64 + 1.0))
                    .unwrap_or(Value::Nil))
            },
            "string.rep" => {
                let s = self.str_arg(&args, 0, "string.rep")?;
                let n = self.num_arg(&args, 1, "string.rep")?.max(0.0) as usize;
                if s.len().saturating_mul(n) > self.limits.string_bytes_max {
                    return Err(limit("string length limit exceeded"));
                }
                self.make_str(s.repeat(n))
            },

            // math
            "math.floor" => {
                Ok(Value::Num(self.num_arg(&args, 0, "math.floor")?.floor()))
            },
            "math.ceil" => {
                Ok(Value::Num(self.num_arg(&args, 0, "math.ceil")?.ceil()))
            },
            "math.abs" => Ok(Value::Num(self.num_arg(&args, 0, "math.abs")?.abs())),
            "math.sqrt" => {
                Ok(Value::Num(self.num_arg(&args, 0, "math.sqrt")?.sqrt()))
            },
            "math.min" => {
                let mut best = self.num_arg(&args, 0, "math.min")?;
                for v in args.iter().skip(1) {
                    let n = v.as_num().ok_or_else(|| rt("math.min: bad argument"))?;
                    best = best.min(n);
                }
                Ok(Value::Num(best))
            },
            "math.max" => {
                let mut best = self.num_arg(&args, 0, "math.max")?;
                for v in args.iter().skip(1) {
                    let n = v.as_num().ok_or_else(|| rt("math.max: bad argument"))?;
                    best = best.max(n);
                }
                Ok(Value::Num(best))
            },
            "math.random" => {
                let mut rng = rand::rng();
                match args.len() {
                    0 => Ok(Value::Num(rng.random::<f64>())),
                    1 => {
                        let m = self.num_arg(&args, 0, "math.random")? as i64;
                        if m < 1 {
                            return Err(rt("math.random: empty range"));
                        }
                        Ok(Value::Num(rng.random_range(1..=m) as f64))
                    },
                    _ => {
                        let m = self.num_arg(&args, 0, "math.random")? as i64;
                        let n = self.num_arg(&args, 1, "math.random")? as i64;
                        if m > n {
                            return Err(rt("math.random: empty range"));
                        }
                        Ok(Value::Num(rng.random_range(m..=n) as f64))
                    },
                }
            },

            // table
            "table.insert" => {
                let table = match self.arg(&args, 0) {
                    Value::Table(t) => t,
                    other => {
                        return Err(rt(format!(
                            "table.insert: expected table, got {}",
                            other.type_name()
                        )));
                    },
                };
                self.alloc(32)?;
                let value = self.arg(&args, if args.len() > 2 { 2 } else { 1 });
                let mut t = table.borrow_mut();
                if args.len() > 2 {
                    let pos = self.num_arg(&args, 1, "table.insert")? as i64;
                    let len = t.seq_len();
                    // Shift the tail up to make room.
                    let mut i = len;
                    while i >= pos {
                        if let Some(v) = t.map.get(&Key::Int(i)).cloned() {
                            t.map.insert(Key::Int(i + 1), v);
                        }
                        i -= 1;
                    }
                    t.map.insert(Key::Int(pos), value);
                } else {
                    let next = t.seq_len() + 1;
                    t.map.insert(Key::Int(next), value);
                }
                Ok(Value::Nil)
            },
            "table.remove" => {
                let table = match self.arg(&args, 0) {
                    Value::Table(t) => t,
                    other => {
                        return Err(rt(format!(
                            "table.remove: expected table, got {}",
                            other.type_name()
                        )));
                    },
                };
                let mut t = table.borrow_mut();
                let len = t.seq_len();
                if len == 0 {
                    return Ok(Value::Nil);
                }
                let pos = match self.arg(&args, 1) {
                    Value::Nil => len,
                    v => v.as_num().ok_or_else(|| rt("table.remove: bad position"))?
                        as i64,
                };
                let removed = t.map.remove(&Key::Int(pos)).unwrap_or(Value::Nil);
                // Shift the tail down over the hole.
                let mut i = pos + 1;
                while i <= len {
                    if let Some(v) = t.map.remove(&Key::Int(i)) {
                        t.map.insert(Key::Int(i - 1), v);
                    }
                    i += 1;
                }
                Ok(removed)
            },
            "table.concat" => {
                let table = match self.arg(&args, 0) {
                    Value::Table(t) => t,
                    other => {
                        return Err(rt(format!(
                            "table.concat: expected table, got {}",
                            other.type_name()
                        )));
                    },
                };
                let sep = match self.arg(&args, 1) {
                    Value::Nil => String::new(),
                    v => self.concat_operand(&v)?,
                };
                let parts: Vec<String> = {
                    let t = table.borrow();
                    (1..=t.seq_len())
                        .map(|i| {
                            self.concat_operand(
                                t.map.get(&Key::Int(i)).unwrap_or(&Value::Nil),
                            )
                        })
                        .collect::<CoreResult<_>>()?
                };
                self.make_str(parts.join(&sep))
            },

            // json
            "json.encode" => {
                let v = self.arg(&args, 0);
                let json = serde_json::to_string(&to_json(&v))
                    .map_err(|e| rt(format!("json.encode: {e}")))?;
                self.make_str(json)
            },
            "json.decode" => {
                let s = self.str_arg(&args, 0, "json.decode")?;
                let parsed: serde_json::Value = serde_json::from_str(&s)
                    .map_err(|e| rt(format!("json.decode: {e}")))?;
                self.alloc(s.len())?;
                Ok(from_json(&parsed))
            },

            // html
            "html.escape" => {
                let s = self.str_arg(&args, 0, "html.escape")?;
                self.make_str(html_escape(&s))
            },
            "html.tag" => {
                let tag = self.str_arg(&args, 0, "html.tag")?;
                let content = match self.arg(&args, 1) {
                    Value::Nil => String::new(),
                    v => v.display(),
                };
                let mut attrs = String::new();
                if let Value::Table(t) = self.arg(&args, 2) {
                    for (k, v) in &t.borrow().map {
                        if let Key::Str(k) = k {
                            attrs.push_str(&format!(
                                " {k}=\"{}\"",
                                html_escape(&v.display())
                            ));
                        }
                    }
                }
                self.make_str(format!("<{tag}{attrs}>{content}</{tag}>"))
            },
            "html.link" => {
                let url = self.str_arg(&args, 0, "html.link")?;
                let text = self.str_arg(&args, 1, "html.link")?;
                self.make_str(format!(
                    "<a href=\"{}\">{}</a>",
                    html_escape(&url),
                    html_escape(&text)
                ))
            },

            // response
            "response.set_status" => {
                let code = self.num_arg(&args, 0, "response.set_status")? as u16;
                if !(100..=599).contains(&code) {
                    return Err(rt(format!("invalid status code {code}")));
                }
                self.response.status = code;
                self.explicit_status = true;
                Ok(Value::Nil)
            },
            "response.set_header" => {
                let k = self.str_arg(&args, 0, "response.set_header")?;
                let v = self.str_arg(&args, 1, "response.set_header")?;
                self.alloc(k.len() + v.len())?;
                self.response.headers.insert(k, v);
                Ok(Value::Nil)
            },
            "response.redirect" => {
                let url = self.str_arg(&args, 0, "response.redirect")?;
                if !self.explicit_status {
                    self.response.status = 302;
                }
                self.response.headers.insert("Location".to_string(), url);
                Ok(Value::Nil)
            },
            "response.set_cookie" => {
                let k = self.str_arg(&args, 0, "response.set_cookie")?;
                let v = self.str_arg(&args, 1, "response.set_cookie")?;
                self.alloc(k.len() + v.len())?;
                self.response.cookies_set.insert(k, v);
                Ok(Value::Nil)
            },

            // session
            "session.get" => {
                let k = self.str_arg(&args, 0, "session.get")?;
                Ok(self
                    .session
                    .get(&k)
                    .map(|v| Value::str(v.as_str()))
                    .unwrap_or(Value::Nil))
            },
            "session.set" => {
                let k = self.str_arg(&args, 0, "session.set")?;
                match self.arg(&args, 1) {
                    Value::Nil => {
                        self.session.remove(&k);
                        self.session_updates.insert(k, None);
                    },
                    v => {
                        let v = v.display();
                        self.alloc(k.len() + v.len())?;
                        self.session.insert(k.clone(), v.clone());
                        self.session_updates.insert(k, Some(v));
                    },
                }
                Ok(Value::Nil)
            },

            // storage
            "storage.get" => {
                let k = self.str_arg(&args, 0, "storage.get")?;
                Ok(self
                    .storage
                    .get(&k)
                    .map(|v| Value::str(v.as_str()))
                    .unwrap_or(Value::Nil))
            },
            "storage.set" => {
                let k = self.str_arg(&args, 0, "storage.set")?;
                match self.arg(&args, 1) {
                    Value::Nil => {
                        self.storage.remove(&k);
                        self.storage_updates.insert(k, None);
                    },
                    v => {
                        let v = v.display();
                        self.alloc(k.len() + v.len())?;
                        self.storage.insert(k.clone(), v.clone());
                        self.storage_updates.insert(k, Some(v));
                    },
                }
                Ok(Value::Nil)
            },

            other => Err(rt(format!("unknown builtin {other}"))),
        }
    }
}

pub(crate) fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Environment construction

fn native_table(entries: &[(&str, &'static str)]) -> Value {
    let mut table = Table::default();
    for (k, native) in entries {
        table
            .map
            .insert(Key::Str((*k).to_string()), Value::Native(native));
    }
    Value::Table(Rc::new(RefCell::new(table)))
}

fn str_map_table(map: &BTreeMap<String, String>) -> Value {
    let mut table = Table::default();
    for (k, v) in map {
        table
            .map
            .insert(Key::Str(k.clone()), Value::str(v.as_str()));
    }
    Value::Table(Rc::new(RefCell::new(table)))
}

/// The complete world a handler sees: no filesystem, no network, no host
/// reflection, only these names.
fn build_globals(
    request: &SandboxRequest,
    session: &SessionSnapshot,
) -> Rc<RefCell<Scope>> {
    let root = Rc::new(RefCell::new(Scope::default()));

    for (name, native) in [
        ("print", "print"),
        ("write", "write"),
        ("tostring", "tostring"),
        ("tonumber", "tonumber"),
        ("type", "type"),
        ("clock", "clock"),
    ] {
        Scope::declare(&root, name, Value::Native(native));
    }

    Scope::declare(
        &root,
        "string",
        native_table(&[
            ("len", "string.len"),
            ("sub", "string.sub"),
            ("upper", "string.upper"),
            ("lower", "string.lower"),
            ("find", "string.find"),
            ("rep", "string.rep"),
        ]),
    );

    let math = native_table(&[
        ("floor", "math.floor"),
        ("ceil", "math.ceil"),
        ("abs", "math.abs"),
        ("sqrt", "math.sqrt"),
        ("min", "math.min"),
        ("max", "math.max"),
        ("random", "math.random"),
    ]);
    if let Value::Table(t) = &math {
        t.borrow_mut()
            .map
            .insert(Key::Str("huge".to_string()), Value::Num(f64::INFINITY));
        t.borrow_mut().map.insert(
            Key::Str("pi".to_string()),
            Value::Num(std::f64::consts::PI),
        );
    }
    Scope::declare(&root, "math", math);

    Scope::declare(
        &root,
        "table",
        native_table(&[
            ("insert", "table.insert"),
            ("remove", "table.remove"),
            ("concat", "table.concat"),
        ]),
    );

    Scope::declare(
        &root,
        "json",
        native_table(&[("encode", "json.encode"), ("decode", "json.decode")]),
    );

    Scope::declare(
        &root,
        "html",
        native_table(&[
            ("escape", "html.escape"),
            ("tag", "html.tag"),
            ("link", "html.link"),
        ]),
    );

    let req = {
        let mut table = Table::default();
        let mut put = |k: &str, v: Value| {
            table.map.insert(Key::Str(k.to_string()), v);
        };
        put("method", Value::str(request.method.as_str()));
        put("url", Value::str(request.url.as_str()));
        put("path", Value::str(request.path.as_str()));
        put("params", str_map_table(&request.params));
        put("headers", str_map_table(&request.headers));
        put("cookies", str_map_table(&request.cookies));
        put(
            "body",
            request
                .body
                .as_deref()
                .map(Value::str)
                .unwrap_or(Value::Nil),
        );
        put(
            "session_id",
            session
                .session_id
                .as_deref()
                .map(Value::str)
                .unwrap_or(Value::Nil),
        );
        Value::Table(Rc::new(RefCell::new(table)))
    };
    Scope::declare(&root, "request", req);

    Scope::declare(
        &root,
        "response",
        native_table(&[
            ("set_status", "response.set_status"),
            ("set_header", "response.set_header"),
            ("redirect", "response.redirect"),
            ("set_cookie", "response.set_cookie"),
            ("write", "response.write"),
            ("print", "response.print"),
        ]),
    );

    Scope::declare(
        &root,
        "session",
        native_table(&[("get", "session.get"), ("set", "session.set")]),
    );

    Scope::declare(
        &root,
        "storage",
        native_table(&[("get", "storage.get"), ("set", "storage.set")]),
    );

    root
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> CoreResult<SandboxInvocation> {
        let limits = SandboxLimits {
            wall_clock: std::time::Duration::from_millis(200),
            output_bytes_max: 4096,
            string_bytes_max: 1024,
            memory_bytes_max: 64 * 1024,
            op_budget: 200_000,
        };
        run_script(
            source,
            &limits,
            SandboxRequest {
                method: "GET".to_string(),
                url: "rdnt://site/page".to_string(),
                path: "/page".to_string(),
                params: [("q".to_string(), "redstone".to_string())].into(),
                ..SandboxRequest::default()
            },
            SessionSnapshot {
                session_id: Some("s1".to_string()),
                data: [("visits".to_string(), "2".to_string())].into(),
                storage: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn test_print_and_arithmetic() {
        let out = run("print(\"sum\", 1 + 2 * 3)").expect("run");
        assert_eq!(out.response.body, "sum\t7\n");
        assert_eq!(out.response.status, 200);
    }

    #[test]
    fn test_request_fields_visible() {
        let out = run("write(request.method, \" \", request.params.q)").expect("run");
        assert_eq!(out.response.body, "GET redstone");
    }

    #[test]
    fn test_session_updates_recorded() {
        let out = run(
            "local n = tonumber(session.get(\"visits\")) + 1\n\
             session.set(\"visits\", tostring(n))",
        )
        .expect("run");
        assert_eq!(
            out.session_updates.get("visits"),
            Some(&Some("3".to_string()))
        );
    }

    #[test]
    fn test_infinite_loop_hits_budget() {
        let err = run("while true do end").unwrap_err();
        match err {
            CoreError::Sandbox { kind, .. } => {
                assert!(matches!(
                    kind,
                    SandboxFault::LimitExceeded | SandboxFault::Timeout
                ));
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_output_limit_enforced() {
        let err = run(
            "local s = string.rep(\"x\", 100)\n\
             while true do write(s) end",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sandbox {
                kind: SandboxFault::LimitExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_string_limit_enforced() {
        let err = run(
            "local s = \"x\"\n\
             while true do s = s .. s end",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sandbox {
                kind: SandboxFault::LimitExceeded,
                ..
            }
        ));
    }

    #[test]
    fn test_runtime_error_is_contained() {
        let err = run("local x = nil\nprint(x.field)").unwrap_err();
        assert!(matches!(
            err,
            CoreError::Sandbox {
                kind: SandboxFault::Runtime,
                ..
            }
        ));
    }

    #[test]
    fn test_functions_and_recursion() {
        let out = run(
            "local function fib(n)\n\
               if n < 2 then return n end\n\
               return fib(n - 1) + fib(n - 2)\n\
             end\n\
             write(fib(10))",
        )
        .expect("run");
        assert_eq!(out.response.body, "55");
    }

    #[test]
    fn test_tables_and_iteration() {
        let out = run(
            "local t = {3, 1, 2}\n\
             table.insert(t, 4)\n\
             local sum = 0\n\
             for i, v in ipairs(t) do sum = sum + v end\n\
             write(sum, \"/\", #t)",
        )
        .expect("run");
        assert_eq!(out.response.body, "10/4");
    }

    #[test]
    fn test_json_round_trip() {
        let out = run(
            "local doc = json.decode(\"{\\\"a\\\": [1, 2]}\")\n\
             write(json.encode(doc))",
        )
        .expect("run");
        assert_eq!(out.response.body, "{\"a\":[1.0,2.0]}");
    }

    #[test]
    fn test_redirect_sets_status_and_header() {
        let out = run("response.redirect(\"rdnt://home/\")").expect("run");
        assert_eq!(out.response.status, 302);
        assert_eq!(
            out.response.headers.get("Location").map(String::as_str),
            Some("rdnt://home/")
        );
    }

    #[test]
    fn test_html_escape() {
        let out = run("write(html.escape(\"<b>&\"))").expect("run");
        assert_eq!(out.response.body, "&lt;b&gt;&amp;");
    }

    #[test]
    fn test_no_host_escape_hatches() {
        for source in ["print(os)", "print(io)", "print(require)"] {
            // These names simply do not exist in the environment.
            assert_eq!(run(source).expect("run").response.body, "nil\n");
        }
    }
}
