use std::collections::HashMap;

use vatrun_id_types::RefId;

use super::{BinOp, Expr, Program, ScriptError, Stmt, Target, UnOp};
use crate::value::{self, NativeName, Value};

/// The host side of guest execution.
///
/// Every effect a guest can cause goes through this trait; the turn
/// implements it. Errors returned here are host errors (confinement faults,
/// missing entities, storage failures) and keep their own classification when
/// they abort the interpreter.
pub trait Host {
    /// Diagnostic sink for the guest's `log(msg)`.
    fn log(&mut self, msg: &str);

    /// Test hook for the guest's `debug(x)`. A host without a sink ignores it.
    fn debug(&mut self, value: Value);

    /// Asynchronous send to an urbject reference. Never returns a result
    /// value to the guest.
    fn send(&mut self, target: &RefId, args: Value) -> crate::Result<Value>;

    /// Synchronous call of an urbject on the same vat.
    fn call(&mut self, target: &RefId, args: Value) -> crate::Result<Value>;

    /// Invocation of a native power.
    fn native(&mut self, native: NativeName, args: Vec<Value>) -> crate::Result<Value>;
}

/// Recursion limit for guest-to-guest function calls within one frame.
const MAX_CALL_DEPTH: u32 = 64;

/// Tree-walking interpreter over one compiled program.
pub struct Interp<'a> {
    program: &'a Program,
    host: &'a mut dyn Host,
    depth: u32,
}

/// Statement outcome: fall through, or unwind with a return value.
enum Flow {
    Normal,
    Return(Value),
}

type Scope = HashMap<String, Value>;

type EvalResult<T> = Result<T, ScriptError>;

impl<'a> Interp<'a> {
    pub fn new(program: &'a Program, host: &'a mut dyn Host) -> Self {
        Interp {
            program,
            host,
            depth: 0,
        }
    }

    /// Runs a top-level function of the program with the given arguments.
    pub fn call_function(&mut self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        let def = self
            .program
            .function(name)
            .ok_or_else(|| ScriptError::MissingFunction(name.to_string()))?;
        if def.params.len() != args.len() {
            return Err(ScriptError::runtime(format!(
                "function '{}' takes {} arguments, got {}",
                name,
                def.params.len(),
                args.len()
            )));
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::runtime("function call depth exceeded"));
        }
        self.depth += 1;
        let mut scope: Scope = def
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect();
        let result = self.exec_block(&def.body, &mut scope);
        self.depth -= 1;
        match result? {
            Flow::Return(v) => Ok(v),
            Flow::Normal => Ok(Value::Null),
        }
    }

    fn exec_block(&mut self, stmts: &[Stmt], scope: &mut Scope) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> EvalResult<Flow> {
        match stmt {
            Stmt::Let(name, expr) => {
                let value = self.eval(expr, scope)?;
                scope.insert(name.clone(), value);
            }
            Stmt::Assign(target, expr) => {
                let value = self.eval(expr, scope)?;
                self.assign(target, value, scope)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if self.condition(cond, scope)? {
                    then
                } else {
                    otherwise
                };
                return self.exec_block(branch, scope);
            }
            Stmt::While { cond, body } => {
                while self.condition(cond, scope)? {
                    match self.exec_block(body, scope)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(e) => self.eval(e, scope)?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn condition(&mut self, cond: &Expr, scope: &mut Scope) -> EvalResult<bool> {
        match self.eval(cond, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ScriptError::runtime(format!(
                "condition must be a boolean, got {}",
                other.type_name()
            ))),
        }
    }

    fn assign(&mut self, target: &Target, value: Value, scope: &mut Scope) -> EvalResult<()> {
        match target {
            Target::Var(name) => {
                if !scope.contains_key(name) {
                    return Err(ScriptError::runtime(format!(
                        "assignment to undefined name '{name}'"
                    )));
                }
                scope.insert(name.clone(), value);
                Ok(())
            }
            Target::Index(base, key) => {
                let base = self.eval(base, scope)?;
                let key = self.eval(key, scope)?;
                match (&base, key) {
                    (Value::Map(cell), Value::Str(key)) => {
                        cell.borrow_mut().insert(key, value);
                        Ok(())
                    }
                    (Value::Map(_), key) => Err(ScriptError::runtime(format!(
                        "map keys must be strings, got {}",
                        key.type_name()
                    ))),
                    (Value::List(cell), Value::Int(idx)) => {
                        let mut items = cell.borrow_mut();
                        let slot = usize::try_from(idx)
                            .ok()
                            .and_then(|i| items.get_mut(i))
                            .ok_or_else(|| {
                                ScriptError::runtime(format!("list index {idx} out of range"))
                            })?;
                        *slot = value;
                        Ok(())
                    }
                    (Value::List(_), key) => Err(ScriptError::runtime(format!(
                        "list indices must be integers, got {}",
                        key.type_name()
                    ))),
                    (other, _) => Err(ScriptError::runtime(format!(
                        "cannot assign into a {}",
                        other.type_name()
                    ))),
                }
            }
        }
    }

    fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> EvalResult<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::list_from(out))
            }
            Expr::Map(entries) => {
                let mut out = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    out.insert(key.clone(), self.eval(value, scope)?);
                }
                Ok(Value::map_from(out))
            }
            Expr::Var(name) => self.lookup(name, scope),
            Expr::Index(base, key) => {
                let base = self.eval(base, scope)?;
                let key = self.eval(key, scope)?;
                self.index(&base, &key)
            }
            Expr::Call(callee, args) => self.eval_call(callee, args, scope),
            Expr::Method(recv, name, args) => self.eval_method(recv, name, args, scope),
            Expr::Unary(op, inner) => {
                let inner = self.eval(inner, scope)?;
                unary(*op, inner)
            }
            Expr::Binary(BinOp::And, lhs, rhs) => {
                if self.condition(lhs, scope)? {
                    Ok(Value::Bool(self.condition(rhs, scope)?))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Expr::Binary(BinOp::Or, lhs, rhs) => {
                if self.condition(lhs, scope)? {
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(self.condition(rhs, scope)?))
                }
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, scope)?;
                let rhs = self.eval(rhs, scope)?;
                binary(*op, lhs, rhs)
            }
        }
    }

    fn lookup(&self, name: &str, scope: &Scope) -> EvalResult<Value> {
        scope
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::runtime(format!("unknown name '{name}'")))
    }

    fn index(&self, base: &Value, key: &Value) -> EvalResult<Value> {
        match (base, key) {
            (Value::Map(cell), Value::Str(key)) => {
                cell.borrow().get(key).cloned().ok_or_else(|| {
                    ScriptError::runtime(format!("no such key '{key}'"))
                })
            }
            (Value::Map(_), key) => Err(ScriptError::runtime(format!(
                "map keys must be strings, got {}",
                key.type_name()
            ))),
            (Value::List(cell), Value::Int(idx)) => {
                let items = cell.borrow();
                usize::try_from(*idx)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| ScriptError::runtime(format!("list index {idx} out of range")))
            }
            (Value::List(_), key) => Err(ScriptError::runtime(format!(
                "list indices must be integers, got {}",
                key.type_name()
            ))),
            (other, _) => Err(ScriptError::runtime(format!(
                "cannot index into a {}",
                other.type_name()
            ))),
        }
    }

    fn eval_call(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        scope: &mut Scope,
    ) -> EvalResult<Value> {
        // builtins and program functions are reached by bare name
        if let Expr::Var(name) = callee {
            match name.as_str() {
                "log" => {
                    let [arg]: [Value; 1] = self.eval_args(args, scope, 1, "log")?.try_into().unwrap();
                    let line = match &arg {
                        Value::Str(s) => s.clone(),
                        other => other.to_string(),
                    };
                    self.host.log(&line);
                    return Ok(Value::Null);
                }
                "add" => {
                    let [a, b]: [Value; 2] =
                        self.eval_args(args, scope, 2, "add")?.try_into().unwrap();
                    return value::add(&a, &b).ok_or_else(|| {
                        ScriptError::runtime("add() expects two mappings")
                    });
                }
                "debug" => {
                    let [arg]: [Value; 1] = self
                        .eval_args(args, scope, 1, "debug")?
                        .try_into()
                        .unwrap();
                    self.host.debug(arg);
                    return Ok(Value::Null);
                }
                _ => {
                    if self.program.function(name).is_some() {
                        let mut values = Vec::with_capacity(args.len());
                        for arg in args {
                            values.push(self.eval(arg, scope)?);
                        }
                        return self.call_function(name, values);
                    }
                }
            }
        }
        // anything else must evaluate to a callable host object
        let callee = self.eval(callee, scope)?;
        match callee {
            Value::Native(native) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                self.host
                    .native(native, values)
                    .map_err(|e| ScriptError::Host(Box::new(e)))
            }
            other => Err(ScriptError::runtime(format!(
                "a {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn eval_method(
        &mut self,
        recv: &Expr,
        name: &str,
        args: &[Expr],
        scope: &mut Scope,
    ) -> EvalResult<Value> {
        let recv = self.eval(recv, scope)?;
        let refid = match &recv {
            Value::Reference(refid) => refid.clone(),
            other => {
                return Err(ScriptError::runtime(format!(
                    "a {} has no methods",
                    other.type_name()
                )))
            }
        };
        match name {
            "send" => {
                let [arg]: [Value; 1] = self.eval_args(args, scope, 1, "send")?.try_into().unwrap();
                self.host
                    .send(&refid, arg)
                    .map_err(|e| ScriptError::Host(Box::new(e)))
            }
            "call" => {
                let [arg]: [Value; 1] = self.eval_args(args, scope, 1, "call")?.try_into().unwrap();
                self.host
                    .call(&refid, arg)
                    .map_err(|e| ScriptError::Host(Box::new(e)))
            }
            other => Err(ScriptError::runtime(format!(
                "references have no method '{other}'"
            ))),
        }
    }

    fn eval_args(
        &mut self,
        args: &[Expr],
        scope: &mut Scope,
        expected: usize,
        what: &str,
    ) -> EvalResult<Vec<Value>> {
        if args.len() != expected {
            return Err(ScriptError::runtime(format!(
                "{what}() takes {expected} argument(s), got {}",
                args.len()
            )));
        }
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope)?);
        }
        Ok(values)
    }
}

fn unary(op: UnOp, value: Value) -> EvalResult<Value> {
    match (op, value) {
        (UnOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| ScriptError::runtime("integer overflow")),
        (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (op, value) => Err(ScriptError::runtime(format!(
            "invalid operand for {:?}: {}",
            op,
            value.type_name()
        ))),
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> EvalResult<Value> {
    use BinOp::*;
    match op {
        Eq => return Ok(Value::Bool(lhs == rhs)),
        Ne => return Ok(Value::Bool(lhs != rhs)),
        _ => {}
    }
    match (op, &lhs, &rhs) {
        // string concatenation and comparison
        (Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
        (Lt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a < b)),
        (Le, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a <= b)),
        (Gt, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a > b)),
        (Ge, Value::Str(a), Value::Str(b)) => Ok(Value::Bool(a >= b)),
        // integer arithmetic is checked; mixed numeric promotes to float
        (_, Value::Int(a), Value::Int(b)) => int_binary(op, *a, *b),
        (_, Value::Float(a), Value::Float(b)) => float_binary(op, *a, *b),
        (_, Value::Int(a), Value::Float(b)) => float_binary(op, *a as f64, *b),
        (_, Value::Float(a), Value::Int(b)) => float_binary(op, *a, *b as f64),
        _ => Err(ScriptError::runtime(format!(
            "invalid operands: {} {:?} {}",
            lhs.type_name(),
            op,
            rhs.type_name()
        ))),
    }
}

fn int_binary(op: BinOp, a: i64, b: i64) -> EvalResult<Value> {
    let overflow = || ScriptError::runtime("integer overflow");
    match op {
        BinOp::Add => a.checked_add(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Sub => a.checked_sub(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Mul => a.checked_mul(b).map(Value::Int).ok_or_else(overflow),
        BinOp::Div => {
            if b == 0 {
                Err(ScriptError::runtime("division by zero"))
            } else {
                a.checked_div(b).map(Value::Int).ok_or_else(overflow)
            }
        }
        BinOp::Rem => {
            if b == 0 {
                Err(ScriptError::runtime("division by zero"))
            } else {
                a.checked_rem(b).map(Value::Int).ok_or_else(overflow)
            }
        }
        BinOp::Lt => Ok(Value::Bool(a < b)),
        BinOp::Le => Ok(Value::Bool(a <= b)),
        BinOp::Gt => Ok(Value::Bool(a > b)),
        BinOp::Ge => Ok(Value::Bool(a >= b)),
        _ => unreachable!("handled above"),
    }
}

fn float_binary(op: BinOp, a: f64, b: f64) -> EvalResult<Value> {
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div => Ok(Value::Float(a / b)),
        BinOp::Rem => Ok(Value::Float(a % b)),
        BinOp::Lt => Ok(Value::Bool(a < b)),
        BinOp::Le => Ok(Value::Bool(a <= b)),
        BinOp::Gt => Ok(Value::Bool(a > b)),
        BinOp::Ge => Ok(Value::Bool(a >= b)),
        _ => unreachable!("handled above"),
    }
}
