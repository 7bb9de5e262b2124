//! Expression engine
//!
//! Intermediate representation for lists of element-wise expressions. An
//! expression computes outputs from inputs using a fixed set of functions
//! and is kept in single static assignment (SSA) form as a sequence of
//! operations on variables. Variable kinds:
//!
//!   %n: input variable
//!   #n: constant input variable
//!   @n: output variable
//!   $n: temporary variable
//!   _n: system-defined number
//!
//! A recipe is the text format for expressions:
//!
//!   <recipe> := <assignment> | <assignment> ';' <recipe>
//!   <assignment> := <variable> '=' <expression>
//!   <expression> := <variable> | <operation>
//!   <operation> := <name> '(' <arg list> ')'
//!   <arg> := <variable> | <expression>

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Variable index in an expression arena.
pub type VarRef = usize;
/// Operation index in an expression arena.
pub type OpRef = usize;

/// Recipe and expression errors.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error in expression: {0}")]
    Syntax(String),

    #[error("unknown operation: {0}")]
    UnknownOp(String),

    #[error("cannot assign to {0} variable")]
    BadAssignment(&'static str),

    #[error("unknown number constant: _{0}")]
    UnknownNumber(i32),
}

/// Variable kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Input,
    Const,
    Output,
    Temp,
    Number,
}

/// Operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Mov,

    // Arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Neg,

    // Functions.
    Relu,
    Log,
    Exp,
    Sigmoid,
    Tanh,
    Sqrt,
    Rsqrt,
    Reciprocal,

    // Fused multiply: MulAdd213 is r=b*a+c etc.
    MulAdd132,
    MulAdd213,
    MulAdd231,
    MulSub132,
    MulSub213,
    MulSub231,

    // Comparison, producing 0/1 masks.
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logic on 0/1 masks.
    And,
    Or,
    Xor,
    Not,
    AndNot,
    Cond,

    // Reductions over all elements.
    Sum,
    MaxRed,
    MinRed,
}

static OP_NAMES: &[(OpKind, &str)] = &[
    (OpKind::Mov, "Id"),
    (OpKind::Add, "Add"),
    (OpKind::Sub, "Sub"),
    (OpKind::Mul, "Mul"),
    (OpKind::Div, "Div"),
    (OpKind::Min, "Min"),
    (OpKind::Max, "Max"),
    (OpKind::Neg, "Neg"),
    (OpKind::Relu, "Relu"),
    (OpKind::Log, "Log"),
    (OpKind::Exp, "Exp"),
    (OpKind::Sigmoid, "Sigmoid"),
    (OpKind::Tanh, "Tanh"),
    (OpKind::Sqrt, "Sqrt"),
    (OpKind::Rsqrt, "Rsqrt"),
    (OpKind::Reciprocal, "Reciprocal"),
    (OpKind::MulAdd132, "MulAdd132"),
    (OpKind::MulAdd213, "MulAdd213"),
    (OpKind::MulAdd231, "MulAdd231"),
    (OpKind::MulSub132, "MulSub132"),
    (OpKind::MulSub213, "MulSub213"),
    (OpKind::MulSub231, "MulSub231"),
    (OpKind::Eq, "Eq"),
    (OpKind::Ne, "Ne"),
    (OpKind::Lt, "Lt"),
    (OpKind::Le, "Le"),
    (OpKind::Gt, "Gt"),
    (OpKind::Ge, "Ge"),
    (OpKind::And, "And"),
    (OpKind::Or, "Or"),
    (OpKind::Xor, "Xor"),
    (OpKind::Not, "Not"),
    (OpKind::AndNot, "AndNot"),
    (OpKind::Cond, "Cond"),
    (OpKind::Sum, "Sum"),
    (OpKind::MaxRed, "MaxRed"),
    (OpKind::MinRed, "MinRed"),
];

static OP_LOOKUP: Lazy<HashMap<&'static str, OpKind>> =
    Lazy::new(|| OP_NAMES.iter().map(|&(k, n)| (n, k)).collect());

/// System-defined numeric constants addressable as `_n` in recipes.
pub static NUMBER_VALUES: &[f32] = &[0.0, 1.0, 0.5, 2.0, -1.0];

/// Number ids for the system constant vocabulary.
pub mod number {
    pub const ZERO: i32 = 0;
    pub const ONE: i32 = 1;
    pub const HALF: i32 = 2;
    pub const TWO: i32 = 3;
    pub const N1: i32 = 4;
}

impl OpKind {
    pub fn name(self) -> &'static str {
        OP_NAMES
            .iter()
            .find(|&&(k, _)| k == self)
            .map(|&(_, n)| n)
            .unwrap_or("???")
    }

    /// Look up op kind for op name.
    pub fn lookup(name: &str) -> Option<OpKind> {
        OP_LOOKUP.get(name).copied()
    }

    pub fn commutative(self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::Mul
                | OpKind::Min
                | OpKind::Max
                | OpKind::Eq
                | OpKind::Ne
                | OpKind::And
                | OpKind::Or
                | OpKind::Xor
        )
    }

    pub fn reduction(self) -> bool {
        matches!(self, OpKind::Sum | OpKind::MaxRed | OpKind::MinRed)
    }
}

/// Cost model for expression complexity. Counts are per element and
/// independent of the actual vector width of the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostModel {
    pub arithmetic: u64,
    pub divide: u64,
    pub transcendental: u64,
    pub compare: u64,
    pub logic: u64,
    pub fused: u64,
    pub reduction: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        CostModel {
            arithmetic: 1,
            divide: 12,
            transcendental: 40,
            compare: 1,
            logic: 1,
            fused: 2,
            reduction: 1,
        }
    }
}

impl CostModel {
    pub fn cost(&self, kind: OpKind) -> u64 {
        match kind {
            OpKind::Mov => 0,
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Min
            | OpKind::Max
            | OpKind::Neg
            | OpKind::Relu => self.arithmetic,
            OpKind::Div | OpKind::Sqrt | OpKind::Rsqrt | OpKind::Reciprocal => self.divide,
            OpKind::Log | OpKind::Exp | OpKind::Sigmoid | OpKind::Tanh => self.transcendental,
            OpKind::MulAdd132
            | OpKind::MulAdd213
            | OpKind::MulAdd231
            | OpKind::MulSub132
            | OpKind::MulSub213
            | OpKind::MulSub231 => self.fused,
            OpKind::Eq | OpKind::Ne | OpKind::Lt | OpKind::Le | OpKind::Gt | OpKind::Ge => {
                self.compare
            }
            OpKind::And | OpKind::Or | OpKind::Xor | OpKind::Not | OpKind::AndNot | OpKind::Cond => {
                self.logic
            }
            OpKind::Sum | OpKind::MaxRed | OpKind::MinRed => self.reduction,
        }
    }
}

/// Scalar reference semantics for a single operation.
pub(crate) fn scalar_op(kind: OpKind, a: f32, b: f32, c: f32) -> f32 {
    let mask = |p: bool| if p { 1.0 } else { 0.0 };
    let truthy = |v: f32| v != 0.0;
    match kind {
        OpKind::Mov => a,
        OpKind::Add => a + b,
        OpKind::Sub => a - b,
        OpKind::Mul => a * b,
        OpKind::Div => a / b,
        OpKind::Min => a.min(b),
        OpKind::Max => a.max(b),
        OpKind::Neg => -a,
        OpKind::Relu => a.max(0.0),
        OpKind::Log => a.ln(),
        OpKind::Exp => a.exp(),
        OpKind::Sigmoid => 1.0 / (1.0 + (-a).exp()),
        OpKind::Tanh => a.tanh(),
        OpKind::Sqrt => a.sqrt(),
        OpKind::Rsqrt => 1.0 / a.sqrt(),
        OpKind::Reciprocal => 1.0 / a,
        OpKind::MulAdd132 => a * c + b,
        OpKind::MulAdd213 => b * a + c,
        OpKind::MulAdd231 => b * c + a,
        OpKind::MulSub132 => a * c - b,
        OpKind::MulSub213 => b * a - c,
        OpKind::MulSub231 => b * c - a,
        OpKind::Eq => mask(a == b),
        OpKind::Ne => mask(a != b),
        OpKind::Lt => mask(a < b),
        OpKind::Le => mask(a <= b),
        OpKind::Gt => mask(a > b),
        OpKind::Ge => mask(a >= b),
        OpKind::And => mask(truthy(a) && truthy(b)),
        OpKind::Or => mask(truthy(a) || truthy(b)),
        OpKind::Xor => mask(truthy(a) != truthy(b)),
        OpKind::Not => mask(!truthy(a)),
        OpKind::AndNot => mask(!truthy(a) && truthy(b)),
        OpKind::Cond => {
            if truthy(a) {
                b
            } else {
                c
            }
        }
        // Reduction combine step; the accumulator is the first argument.
        OpKind::Sum => a + b,
        OpKind::MaxRed => a.max(b),
        OpKind::MinRed => a.min(b),
    }
}

/// Identity element for a reduction accumulator.
pub(crate) fn reduction_identity(kind: OpKind) -> f32 {
    match kind {
        OpKind::Sum => 0.0,
        OpKind::MaxRed => f32::NEG_INFINITY,
        OpKind::MinRed => f32::INFINITY,
        _ => 0.0,
    }
}

/// Variable in an expression.
#[derive(Debug, Clone)]
pub struct Var {
    pub kind: VarKind,
    /// Variable id; -1 for unassigned temps.
    pub id: i32,
    pub producer: Option<OpRef>,
    pub consumers: Vec<OpRef>,

    // Live range.
    pub first: Option<OpRef>,
    pub last: Option<OpRef>,

    dead: bool,
}

impl Var {
    pub fn as_string(&self) -> String {
        let ch = match self.kind {
            VarKind::Input => '%',
            VarKind::Const => '#',
            VarKind::Output => '@',
            VarKind::Temp => '$',
            VarKind::Number => '_',
        };
        format!("{}{}", ch, self.id)
    }
}

/// Operation in an expression, computing result = kind(args...).
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub result: Option<VarRef>,
    pub args: Vec<VarRef>,

    // Register assignment for operands; -1 if unassigned.
    pub dst: i32,
    pub src: i32,
    pub src2: i32,
    pub first_is_dest: bool,

    dead: bool,
}

impl Op {
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

/// Expression: SSA list of operations over typed variables.
#[derive(Debug, Clone, Default)]
pub struct Express {
    vars: Vec<Var>,
    ops: Vec<Op>,
    /// Evaluation order of live operations.
    order: Vec<OpRef>,
}

impl Express {
    pub fn new() -> Self {
        Express::default()
    }

    /// Parse a recipe into this expression.
    pub fn parse(&mut self, recipe: &str) -> Result<(), ExprError> {
        let mut parser = RecipeParser {
            chars: recipe.as_bytes(),
            pos: 0,
        };
        parser.parse(self)?;
        self.compact_temp_vars();
        Ok(())
    }

    /// Parse a recipe into a fresh expression.
    pub fn from_recipe(recipe: &str) -> Result<Express, ExprError> {
        let mut expr = Express::new();
        expr.parse(recipe)?;
        Ok(expr)
    }

    pub fn var(&self, r: VarRef) -> &Var {
        &self.vars[r]
    }

    pub fn var_mut(&mut self, r: VarRef) -> &mut Var {
        &mut self.vars[r]
    }

    pub fn op(&self, r: OpRef) -> &Op {
        &self.ops[r]
    }

    pub fn op_mut(&mut self, r: OpRef) -> &mut Op {
        &mut self.ops[r]
    }

    /// Live operations in evaluation order.
    pub fn ops_in_order(&self) -> &[OpRef] {
        &self.order
    }

    /// Live variable references.
    pub fn live_vars(&self) -> Vec<VarRef> {
        (0..self.vars.len()).filter(|&v| !self.vars[v].dead).collect()
    }

    /// An inlined variable is a temporary only needed in a single context.
    pub fn inlined(&self, r: VarRef) -> bool {
        let var = &self.vars[r];
        var.kind == VarKind::Temp && var.consumers.len() == 1
    }

    /// Look up a variable, adding it if it does not exist.
    pub fn variable(&mut self, kind: VarKind, id: i32) -> VarRef {
        if id != -1 {
            if let Some(r) = self.lookup_var(kind, id) {
                return r;
            }
        }
        self.vars.push(Var {
            kind,
            id,
            producer: None,
            consumers: Vec::new(),
            first: None,
            last: None,
            dead: false,
        });
        self.vars.len() - 1
    }

    pub fn lookup_var(&self, kind: VarKind, id: i32) -> Option<VarRef> {
        (0..self.vars.len())
            .find(|&r| !self.vars[r].dead && self.vars[r].kind == kind && self.vars[r].id == id)
    }

    /// Add a new unassigned temporary variable.
    pub fn new_temp(&mut self) -> VarRef {
        self.vars.push(Var {
            kind: VarKind::Temp,
            id: -1,
            producer: None,
            consumers: Vec::new(),
            first: None,
            last: None,
            dead: false,
        });
        self.vars.len() - 1
    }

    /// Add a number variable for a system constant.
    pub fn number(&mut self, id: i32) -> VarRef {
        self.variable(VarKind::Number, id)
    }

    fn push_op(&mut self, kind: OpKind) -> OpRef {
        self.ops.push(Op {
            kind,
            result: None,
            args: Vec::new(),
            dst: -1,
            src: -1,
            src2: -1,
            first_is_dest: false,
            dead: false,
        });
        self.ops.len() - 1
    }

    /// Append a new operation.
    pub fn operation(&mut self, kind: OpKind) -> OpRef {
        let op = self.push_op(kind);
        self.order.push(op);
        op
    }

    /// Insert a new operation before another in evaluation order.
    pub fn operation_before(&mut self, pos: OpRef, kind: OpKind) -> OpRef {
        let op = self.push_op(kind);
        let at = self.order.iter().position(|&o| o == pos).unwrap_or(0);
        self.order.insert(at, op);
        op
    }

    /// Insert a new operation after another in evaluation order.
    pub fn operation_after(&mut self, pos: OpRef, kind: OpKind) -> OpRef {
        let op = self.push_op(kind);
        let at = self
            .order
            .iter()
            .position(|&o| o == pos)
            .map(|p| p + 1)
            .unwrap_or(self.order.len());
        self.order.insert(at, op);
        op
    }

    /// Assign the result of an operation to a variable.
    pub fn assign(&mut self, op: OpRef, var: VarRef) {
        if let Some(prev) = self.ops[op].result {
            self.vars[prev].producer = None;
        }
        if let Some(prev) = self.vars[var].producer {
            self.ops[prev].result = None;
        }
        self.ops[op].result = Some(var);
        self.vars[var].producer = Some(op);
    }

    /// Add an argument to an operation.
    pub fn add_argument(&mut self, op: OpRef, arg: VarRef) {
        self.vars[arg].consumers.push(op);
        self.ops[op].args.push(arg);
    }

    /// Remove all arguments of an operation.
    pub fn clear_arguments(&mut self, op: OpRef) {
        let args = std::mem::take(&mut self.ops[op].args);
        for arg in args {
            if let Some(pos) = self.vars[arg].consumers.iter().position(|&o| o == op) {
                self.vars[arg].consumers.remove(pos);
            }
        }
    }

    /// Remove an operation from the expression.
    pub fn remove_op(&mut self, op: OpRef) {
        if let Some(result) = self.ops[op].result {
            self.vars[result].producer = None;
        }
        self.ops[op].result = None;
        self.clear_arguments(op);
        self.order.retain(|&o| o != op);
        self.ops[op].dead = true;
    }

    /// Remove an unused variable from the expression.
    pub fn remove_var(&mut self, var: VarRef) {
        debug_assert!(self.vars[var].producer.is_none());
        debug_assert!(self.vars[var].consumers.is_empty());
        self.vars[var].dead = true;
    }

    /// Redirect all consumers of a variable to another variable.
    pub fn redirect(&mut self, from: VarRef, to: VarRef) {
        let consumers = std::mem::take(&mut self.vars[from].consumers);
        for op in consumers {
            for arg in &mut self.ops[op].args {
                if *arg == from {
                    *arg = to;
                }
            }
            self.vars[to].consumers.push(op);
        }
    }

    /// Number of variables of a kind.
    pub fn num_vars(&self, kind: VarKind) -> usize {
        self.vars.iter().filter(|v| !v.dead && v.kind == kind).count()
    }

    /// Number of operations of a kind.
    pub fn num_ops(&self, kind: OpKind) -> usize {
        self.order.iter().filter(|&&o| self.ops[o].kind == kind).count()
    }

    pub fn has(&self, kind: OpKind) -> bool {
        self.num_ops(kind) > 0
    }

    /// Check if the expression contains a reduction whose result feeds
    /// another operation in the same expression.
    pub fn has_internal_reduction(&self) -> bool {
        self.order.iter().any(|&o| {
            self.ops[o].kind.reduction()
                && self.ops[o]
                    .result
                    .map(|r| !self.vars[r].consumers.is_empty())
                    .unwrap_or(false)
        })
    }

    /// Assign sequential ids to temporary variables. Returns the number of
    /// temporaries.
    pub fn compact_temp_vars(&mut self) -> usize {
        let mut n = 0;
        for var in self.vars.iter_mut() {
            if !var.dead && var.kind == VarKind::Temp {
                var.id = n as i32;
                n += 1;
            }
        }
        n
    }

    /// Eliminate common subexpressions.
    pub fn eliminate_common_subexpressions(&mut self) {
        let mut iterations = 0;
        while self.try_to_eliminate_ops() {
            iterations += 1;
        }
        if iterations > 0 {
            self.compact_temp_vars();
        }
    }

    fn ops_equal(&self, a: OpRef, b: OpRef) -> bool {
        let (o1, o2) = (&self.ops[a], &self.ops[b]);
        o1.kind == o2.kind && o1.args == o2.args
    }

    fn try_to_eliminate_ops(&mut self) -> bool {
        for i in 0..self.order.len() {
            for j in (i + 1)..self.order.len() {
                let (op1, op2) = (self.order[i], self.order[j]);
                if !self.ops_equal(op1, op2) {
                    continue;
                }
                let v1 = self.ops[op1].result.unwrap();
                let v2 = self.ops[op2].result.unwrap();
                if self.vars[v1].kind == VarKind::Temp {
                    // Eliminate the first op; the second moves up to its slot.
                    self.order.swap(i, j);
                    self.redirect(v1, v2);
                    self.remove_op(op1);
                    self.remove_var(v1);
                } else if self.vars[v2].kind == VarKind::Temp {
                    self.redirect(v2, v1);
                    self.remove_op(op2);
                    self.remove_var(v2);
                } else {
                    // Two outputs; turn the second op into a move.
                    self.redirect(v2, v1);
                    self.ops[op2].kind = OpKind::Mov;
                    self.clear_arguments(op2);
                    self.add_argument(op2, v1);
                }
                return true;
            }
        }
        false
    }

    /// Cache inputs and results used in multiple places in temporaries so
    /// every multiply-consumed value lives in a register.
    pub fn cache_results(&mut self) {
        let mut cached = 0;
        for var in 0..self.vars.len() {
            if self.vars[var].dead {
                continue;
            }
            if self.vars[var].kind == VarKind::Output && !self.vars[var].consumers.is_empty() {
                // Compute into a temp and move it to the output.
                let op = self.vars[var].producer.expect("output has no producer");
                self.vars[var].producer = None;
                let temp = self.new_temp();
                self.ops[op].result = Some(temp);
                self.vars[temp].producer = Some(op);
                let consumers = std::mem::take(&mut self.vars[var].consumers);
                self.vars[temp].consumers = consumers;
                for o in self.order.clone() {
                    for arg in &mut self.ops[o].args {
                        if *arg == var {
                            *arg = temp;
                        }
                    }
                }
                let assign = self.operation_after(op, OpKind::Mov);
                self.assign(assign, var);
                self.add_argument(assign, temp);
                cached += 1;
            } else if self.vars[var].kind != VarKind::Temp && self.vars[var].consumers.len() > 1 {
                // Load the shared input into a temp before its first use.
                let temp = self.new_temp();
                let consumers = std::mem::take(&mut self.vars[var].consumers);
                self.vars[temp].consumers = consumers;
                let mut first = None;
                for &o in &self.order {
                    let mut used = false;
                    for arg in &mut self.ops[o].args {
                        if *arg == var {
                            *arg = temp;
                            used = true;
                        }
                    }
                    if used && first.is_none() {
                        first = Some(o);
                    }
                }
                let first = first.expect("consumer not found");
                let assign = self.operation_before(first, OpKind::Mov);
                self.assign(assign, temp);
                self.add_argument(assign, var);
                cached += 1;
            }
        }
        if cached > 0 {
            self.compact_temp_vars();
        }
    }

    /// Compute live ranges for all variables.
    pub fn compute_live_ranges(&mut self) {
        for &op in &self.order.clone() {
            if let Some(result) = self.ops[op].result {
                if self.vars[result].first.is_none() {
                    self.vars[result].first = Some(op);
                }
                self.vars[result].last = Some(op);
            }
            for arg in self.ops[op].args.clone() {
                if self.vars[arg].first.is_none() {
                    self.vars[arg].first = Some(op);
                }
                self.vars[arg].last = Some(op);
            }
        }
    }

    /// Maximum number of simultaneously live temporaries.
    pub fn max_active_temps(&self) -> usize {
        let mut active: i64 = 0;
        let mut max_active: i64 = 0;
        for &op in &self.order {
            if let Some(result) = self.ops[op].result {
                if self.vars[result].first == Some(op) && self.vars[result].kind == VarKind::Temp {
                    active += 1;
                }
            }
            if active > max_active {
                max_active = active;
            }
            for &arg in &self.ops[op].args {
                if self.vars[arg].last == Some(op) && self.vars[arg].kind == VarKind::Temp {
                    active -= 1;
                }
            }
        }
        max_active as usize
    }

    /// Merge another expression into this one. `varmap` maps variable refs
    /// in `other` to variable refs in this expression; unmapped variables
    /// are imported as-is.
    pub fn merge(&mut self, other: &Express, varmap: &HashMap<VarRef, VarRef>) {
        let mut var_remap: HashMap<VarRef, VarRef> = HashMap::new();
        let mut temps_moved = false;
        for v in 0..other.vars.len() {
            if other.vars[v].dead {
                continue;
            }
            if let Some(&target) = varmap.get(&v) {
                var_remap.insert(v, target);
            } else {
                let mut var = other.vars[v].clone();
                var.producer = None;
                var.consumers.clear();
                var.first = None;
                var.last = None;
                if var.kind == VarKind::Temp {
                    temps_moved = true;
                }
                self.vars.push(var);
                var_remap.insert(v, self.vars.len() - 1);
            }
        }

        for &o in &other.order {
            let src = &other.ops[o];
            let op = self.operation(src.kind);
            if let Some(result) = src.result {
                let target = var_remap[&result];
                self.assign(op, target);
            }
            for &arg in &src.args {
                let target = var_remap[&arg];
                self.add_argument(op, target);
            }
        }

        if temps_moved {
            self.compact_temp_vars();
        }
    }

    /// Fuse operations: outer(inner(a,b),c) becomes left(a,b,c) and
    /// outer(a,inner(b,c)) becomes right(a,b,c).
    pub fn fuse(&mut self, outer: OpKind, inner: OpKind, left: OpKind, right: OpKind) {
        let mut again = true;
        while again {
            again = false;
            for &op in &self.order.clone() {
                if self.ops[op].dead || self.ops[op].kind != outer {
                    continue;
                }
                if self.ops[op].arity() != 2 {
                    continue;
                }
                if self.try_fuse(op, 0, inner, left) || self.try_fuse(op, 1, inner, right) {
                    again = true;
                    break;
                }
            }
        }
    }

    pub fn fuse_mul_add(&mut self) {
        self.fuse(OpKind::Add, OpKind::Mul, OpKind::MulAdd213, OpKind::MulAdd231);
    }

    pub fn fuse_mul_sub(&mut self) {
        self.fuse(OpKind::Sub, OpKind::Mul, OpKind::MulSub213, OpKind::MulSub231);
    }

    fn try_fuse(&mut self, op: OpRef, argno: usize, inner: OpKind, combined: OpKind) -> bool {
        let intermediate = self.ops[op].args[argno];
        if !self.inlined(intermediate) {
            return false;
        }
        let sub = match self.vars[intermediate].producer {
            Some(s) => s,
            None => return false,
        };
        if self.ops[sub].kind != inner || self.ops[sub].arity() != 2 {
            return false;
        }

        let (a, b, c) = if argno == 0 {
            // outer(inner(a,b),c) -> combined(a,b,c)
            (self.ops[sub].args[0], self.ops[sub].args[1], self.ops[op].args[1])
        } else {
            // outer(a,inner(b,c)) -> combined(a,b,c)
            (self.ops[op].args[0], self.ops[sub].args[0], self.ops[sub].args[1])
        };

        self.ops[op].kind = combined;
        self.clear_arguments(op);
        self.add_argument(op, a);
        self.add_argument(op, b);
        self.add_argument(op, c);

        self.remove_op(sub);
        self.remove_var(intermediate);
        true
    }

    /// Allocate registers for all temporaries. Returns the number of
    /// registers used. Live ranges must be computed first.
    pub fn allocate_registers(&mut self) -> usize {
        let mut regs = RegisterAllocator::default();
        for &op in &self.order.clone() {
            if self.ops[op].kind == OpKind::Mov {
                let result = self.ops[op].result.expect("mov without result");
                let arg = self.ops[op].args[0];
                if self.vars[result].kind == VarKind::Temp {
                    if self.vars[result].first == Some(op) {
                        if self.vars[arg].kind == VarKind::Temp && self.vars[arg].last == Some(op) {
                            // Steal the register from the source.
                            let r = regs.transfer(arg, result);
                            self.ops[op].dst = r;
                            self.ops[op].src = r;
                        } else {
                            self.ops[op].dst = regs.allocate(result);
                        }
                    } else {
                        self.ops[op].dst = regs.get(result);
                    }
                }
                if self.vars[arg].kind == VarKind::Temp && self.ops[op].src == -1 {
                    self.ops[op].src = regs.get(arg);
                }
                if self.vars[arg].kind == VarKind::Temp && self.vars[arg].last == Some(op) {
                    regs.free(arg);
                }
            } else {
                if let Some(result) = self.ops[op].result {
                    if self.vars[result].kind == VarKind::Temp {
                        if self.vars[result].first == Some(op) {
                            self.ops[op].dst = regs.allocate(result);
                        } else {
                            self.ops[op].dst = regs.get(result);
                        }
                    }
                }
                let first = if self.ops[op].first_is_dest { 1 } else { 0 };
                let second = first + 1;
                if self.ops[op].arity() > first {
                    let arg = self.ops[op].args[first];
                    if self.vars[arg].kind == VarKind::Temp {
                        self.ops[op].src = regs.get(arg);
                    }
                }
                if self.ops[op].arity() > second {
                    let arg = self.ops[op].args[second];
                    if self.vars[arg].kind == VarKind::Temp {
                        self.ops[op].src2 = regs.get(arg);
                    }
                }
                for argno in [first, second] {
                    if self.ops[op].arity() > argno {
                        let arg = self.ops[op].args[argno];
                        if self.vars[arg].kind == VarKind::Temp && self.vars[arg].last == Some(op) {
                            regs.free(arg);
                        }
                    }
                }
            }
        }
        regs.max()
    }

    /// Number of registers referenced by the expression.
    pub fn num_regs(&self) -> usize {
        let mut num = 0;
        for &o in &self.order {
            let op = &self.ops[o];
            for r in [op.dst, op.src, op.src2] {
                if r != -1 && (r + 1) as usize > num {
                    num = (r + 1) as usize;
                }
            }
        }
        num
    }

    /// Complexity of the expression measured against a cost model. Move
    /// operations are free.
    pub fn complexity(&self, cost: &CostModel) -> u64 {
        self.order.iter().map(|&o| cost.cost(self.ops[o].kind)).sum()
    }

    /// Render the recipe for the expression.
    pub fn as_recipe(&self) -> String {
        let mut recipe = String::new();
        let mut first = true;
        for &op in &self.order {
            let result = match self.ops[op].result {
                Some(r) => r,
                None => continue,
            };
            if self.inlined(result) {
                continue;
            }
            if !first {
                recipe.push(';');
            }
            first = false;
            recipe.push_str(&self.vars[result].as_string());
            recipe.push('=');
            self.op_recipe(op, &mut recipe);
        }
        recipe
    }

    fn op_recipe(&self, op: OpRef, recipe: &mut String) {
        recipe.push_str(self.ops[op].kind.name());
        recipe.push('(');
        let mut first = true;
        for &arg in &self.ops[op].args {
            if !first {
                recipe.push(',');
            }
            first = false;
            if self.inlined(arg) {
                let producer = self.vars[arg].producer.expect("inlined var without producer");
                self.op_recipe(producer, recipe);
            } else {
                recipe.push_str(&self.vars[arg].as_string());
            }
        }
        recipe.push(')');
    }

    /// Evaluate the expression for a single element position. Inputs and
    /// constants are indexed by variable id. Reductions act on the single
    /// element. Used for semantic checks.
    pub fn evaluate(
        &self,
        inputs: &[f32],
        consts: &[f32],
        outputs: &mut [f32],
    ) -> Result<(), ExprError> {
        let mut values: Vec<f32> = vec![0.0; self.vars.len()];
        for (r, var) in self.vars.iter().enumerate() {
            if var.dead {
                continue;
            }
            match var.kind {
                VarKind::Input => values[r] = inputs[var.id as usize],
                VarKind::Const => values[r] = consts[var.id as usize],
                VarKind::Number => {
                    let id = var.id as usize;
                    if id >= NUMBER_VALUES.len() {
                        return Err(ExprError::UnknownNumber(var.id));
                    }
                    values[r] = NUMBER_VALUES[id];
                }
                _ => {}
            }
        }
        for &o in &self.order {
            let op = &self.ops[o];
            let a = op.args.first().map(|&v| values[v]).unwrap_or(0.0);
            let b = op.args.get(1).map(|&v| values[v]).unwrap_or(0.0);
            let c = op.args.get(2).map(|&v| values[v]).unwrap_or(0.0);
            let value = if op.kind.reduction() {
                scalar_op(op.kind, reduction_identity(op.kind), a, 0.0)
            } else {
                scalar_op(op.kind, a, b, c)
            };
            if let Some(result) = op.result {
                values[result] = value;
            }
        }
        for (r, var) in self.vars.iter().enumerate() {
            if !var.dead && var.kind == VarKind::Output {
                outputs[var.id as usize] = values[r];
            }
        }
        Ok(())
    }
}

/// Register allocator mapping live variables to a growing register file.
#[derive(Default)]
struct RegisterAllocator {
    reg: Vec<Option<VarRef>>,
}

impl RegisterAllocator {
    fn allocate(&mut self, var: VarRef) -> i32 {
        let mut free = None;
        for (r, slot) in self.reg.iter().enumerate() {
            if *slot == Some(var) {
                return r as i32;
            }
            if free.is_none() && slot.is_none() {
                free = Some(r);
            }
        }
        match free {
            Some(r) => {
                self.reg[r] = Some(var);
                r as i32
            }
            None => {
                self.reg.push(Some(var));
                (self.reg.len() - 1) as i32
            }
        }
    }

    fn transfer(&mut self, src: VarRef, dst: VarRef) -> i32 {
        for (r, slot) in self.reg.iter_mut().enumerate() {
            if *slot == Some(src) {
                *slot = Some(dst);
                return r as i32;
            }
        }
        -1
    }

    fn get(&self, var: VarRef) -> i32 {
        for (r, slot) in self.reg.iter().enumerate() {
            if *slot == Some(var) {
                return r as i32;
            }
        }
        -1
    }

    fn free(&mut self, var: VarRef) {
        for slot in self.reg.iter_mut() {
            if *slot == Some(var) {
                *slot = None;
            }
        }
    }

    fn max(&self) -> usize {
        self.reg.len()
    }
}

/// Recipe parser converting a string to an expression.
struct RecipeParser<'a> {
    chars: &'a [u8],
    pos: usize,
}

impl<'a> RecipeParser<'a> {
    fn parse(&mut self, expr: &mut Express) -> Result<(), ExprError> {
        self.parse_assignment(expr)?;
        while self.is(b';') {
            self.next();
            self.parse_assignment(expr)?;
        }
        if self.more() {
            return Err(self.error("trailing input"));
        }
        Ok(())
    }

    fn parse_assignment(&mut self, expr: &mut Express) -> Result<(), ExprError> {
        let var = self.parse_variable(expr)?;
        match expr.var(var).kind {
            VarKind::Input => return Err(ExprError::BadAssignment("input")),
            VarKind::Const => return Err(ExprError::BadAssignment("constant")),
            VarKind::Number => return Err(ExprError::BadAssignment("number")),
            _ => {}
        }
        if !self.is(b'=') {
            return Err(self.error("expected '='"));
        }
        self.next();
        let op = self.parse_expression(expr)?;
        expr.assign(op, var);
        Ok(())
    }

    fn parse_expression(&mut self, expr: &mut Express) -> Result<OpRef, ExprError> {
        if !self.is_letter() {
            return Err(self.error("operation name expected"));
        }
        let start = self.pos;
        while self.is_letter() || self.is_digit() {
            self.next();
        }
        let name = std::str::from_utf8(&self.chars[start..self.pos])
            .map_err(|_| self.error("invalid operation name"))?
            .to_string();

        if !self.is(b'(') {
            return Err(self.error("expected '('"));
        }
        self.next();
        let mut args = vec![self.parse_argument(expr)?];
        while self.is(b',') {
            self.next();
            args.push(self.parse_argument(expr)?);
        }
        if !self.is(b')') {
            return Err(self.error("expected ')'"));
        }
        self.next();

        let kind = OpKind::lookup(&name).ok_or(ExprError::UnknownOp(name))?;
        let op = expr.operation(kind);
        for arg in args {
            expr.add_argument(op, arg);
        }
        Ok(op)
    }

    fn parse_argument(&mut self, expr: &mut Express) -> Result<VarRef, ExprError> {
        if self.is_var() {
            self.parse_variable(expr)
        } else {
            // Nested expression assigned to an anonymous temp.
            let op = self.parse_expression(expr)?;
            let var = expr.new_temp();
            expr.assign(op, var);
            Ok(var)
        }
    }

    fn parse_variable(&mut self, expr: &mut Express) -> Result<VarRef, ExprError> {
        let kind = match self.current() {
            Some(b'%') => VarKind::Input,
            Some(b'#') => VarKind::Const,
            Some(b'@') => VarKind::Output,
            Some(b'$') => VarKind::Temp,
            Some(b'_') => VarKind::Number,
            _ => return Err(self.error("unknown variable type")),
        };
        self.next();
        let mut id: i32 = 0;
        let mut digits = 0;
        while self.is_digit() {
            id = id * 10 + (self.chars[self.pos] - b'0') as i32;
            self.next();
            digits += 1;
        }
        if digits == 0 {
            return Err(self.error("variable id expected"));
        }
        if kind == VarKind::Number && id as usize >= NUMBER_VALUES.len() {
            return Err(ExprError::UnknownNumber(id));
        }
        Ok(expr.variable(kind, id))
    }

    fn error(&self, msg: &str) -> ExprError {
        let prefix = String::from_utf8_lossy(&self.chars[..self.pos]);
        let suffix = String::from_utf8_lossy(&self.chars[self.pos..]);
        ExprError::Syntax(format!("{}: {}<!>{}", msg, prefix, suffix))
    }

    fn current(&self) -> Option<u8> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) {
        self.pos += 1;
    }

    fn more(&self) -> bool {
        self.pos < self.chars.len()
    }

    fn is(&self, ch: u8) -> bool {
        self.current() == Some(ch)
    }

    fn is_digit(&self) -> bool {
        matches!(self.current(), Some(c) if c.is_ascii_digit())
    }

    fn is_letter(&self) -> bool {
        matches!(self.current(), Some(c) if c.is_ascii_alphabetic())
    }

    fn is_var(&self) -> bool {
        matches!(self.current(), Some(b'%' | b'#' | b'@' | b'$' | b'_'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for recipe in [
            "@0=Add(%0,%1)",
            "@0=Mul(Add(%0,%1),%2)",
            "@0=Add(%0,%1);@1=Mul(@0,%2)",
            "$0=Add(%0,#0);@0=Mul($0,$0)",
            "@0=Max(%0,_0)",
            "@0=Sum(Mul(%0,%1))",
        ] {
            let expr = Express::from_recipe(recipe).unwrap();
            assert_eq!(expr.as_recipe(), recipe, "recipe: {}", recipe);
        }
    }

    #[test]
    fn test_random_recipe_roundtrip_sweep() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const BINARY: &[&str] = &["Add", "Sub", "Mul", "Min", "Max"];
        const UNARY: &[&str] = &["Neg", "Relu", "Tanh", "Sigmoid"];

        fn term(rng: &mut StdRng, inputs: i32, depth: usize) -> String {
            if depth == 0 || rng.gen_bool(0.4) {
                if rng.gen_bool(0.2) {
                    format!("_{}", rng.gen_range(0..NUMBER_VALUES.len()))
                } else {
                    format!("%{}", rng.gen_range(0..inputs))
                }
            } else {
                operation(rng, inputs, depth)
            }
        }

        fn operation(rng: &mut StdRng, inputs: i32, depth: usize) -> String {
            if rng.gen_bool(0.3) {
                let op = UNARY[rng.gen_range(0..UNARY.len())];
                format!("{}({})", op, term(rng, inputs, depth - 1))
            } else {
                let op = BINARY[rng.gen_range(0..BINARY.len())];
                format!(
                    "{}({},{})",
                    op,
                    term(rng, inputs, depth - 1),
                    term(rng, inputs, depth - 1)
                )
            }
        }

        let mut rng = StdRng::seed_from_u64(31);
        for round in 0..200 {
            let inputs = rng.gen_range(1..4);
            let depth = rng.gen_range(1..5);
            let recipe = format!("@0={}", operation(&mut rng, inputs, depth));

            let expr = Express::from_recipe(&recipe).unwrap();
            assert_eq!(expr.as_recipe(), recipe, "round {}: {}", round, recipe);

            // Reparsing the rendered recipe must give the same function.
            let again = Express::from_recipe(&expr.as_recipe()).unwrap();
            let args: Vec<f32> = (0..inputs).map(|_| rng.gen_range(-2.0..2.0)).collect();
            let mut first = [0.0];
            let mut second = [0.0];
            expr.evaluate(&args, &[], &mut first).unwrap();
            again.evaluate(&args, &[], &mut second).unwrap();
            assert_eq!(first[0], second[0], "round {}: {}", round, recipe);
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(Express::from_recipe("%0=Add(%1,%2)").is_err());
        assert!(Express::from_recipe("@0=Bogus(%0)").is_err());
        assert!(Express::from_recipe("@0=Add(%0,%1)x").is_err());
        assert!(Express::from_recipe("@0=Add(%0,_9)").is_err());
    }

    #[test]
    fn test_evaluate() {
        let expr = Express::from_recipe("@0=Mul(Add(%0,%1),%2)").unwrap();
        let mut out = [0.0];
        expr.evaluate(&[2.0, 3.0, 4.0], &[], &mut out).unwrap();
        assert_eq!(out[0], 20.0);
    }

    #[test]
    fn test_cse() {
        let mut expr = Express::from_recipe("@0=Add(Mul(%0,%1),Mul(%0,%1))").unwrap();
        assert_eq!(expr.num_ops(OpKind::Mul), 2);
        expr.eliminate_common_subexpressions();
        assert_eq!(expr.num_ops(OpKind::Mul), 1);
        let mut out = [0.0];
        expr.evaluate(&[3.0, 5.0], &[], &mut out).unwrap();
        assert_eq!(out[0], 30.0);
    }

    #[test]
    fn test_fuse_mul_add() {
        let mut expr = Express::from_recipe("@0=Add(Mul(%0,%1),%2)").unwrap();
        expr.fuse_mul_add();
        assert_eq!(expr.num_ops(OpKind::MulAdd213), 1);
        assert_eq!(expr.num_ops(OpKind::Add), 0);
        let mut out = [0.0];
        expr.evaluate(&[2.0, 3.0, 10.0], &[], &mut out).unwrap();
        assert_eq!(out[0], 16.0);
    }

    #[test]
    fn test_fuse_mul_add_second() {
        let mut expr = Express::from_recipe("@0=Add(%2,Mul(%0,%1))").unwrap();
        expr.fuse_mul_add();
        assert_eq!(expr.num_ops(OpKind::MulAdd231), 1);
        let mut out = [0.0];
        expr.evaluate(&[2.0, 3.0, 10.0], &[], &mut out).unwrap();
        assert_eq!(out[0], 16.0);
    }

    #[test]
    fn test_cache_results_and_registers() {
        let mut expr = Express::from_recipe("@0=Mul(Add(%0,%1),Add(%0,%2))").unwrap();
        expr.cache_results();
        expr.compute_live_ranges();
        let regs = expr.allocate_registers();
        assert!(regs >= 2);
        assert_eq!(expr.num_regs(), regs);
        let mut out = [0.0];
        expr.evaluate(&[1.0, 2.0, 3.0], &[], &mut out).unwrap();
        assert_eq!(out[0], 12.0);
    }

    #[test]
    fn test_max_active_temps() {
        let mut expr =
            Express::from_recipe("$0=Add(%0,%1);$1=Mul(%0,%2);@0=Sub($0,$1)").unwrap();
        expr.compute_live_ranges();
        assert_eq!(expr.max_active_temps(), 2);
    }

    #[test]
    fn test_merge() {
        // First expression: @0=Add(%0,%1). Second: @0=Mul(%0,%2), where the
        // second's %0 is the first's @0 demoted to a temp.
        let mut first = Express::from_recipe("@0=Add(%0,%1)").unwrap();
        let second = Express::from_recipe("@0=Mul(%0,%1)").unwrap();

        let out0 = first.lookup_var(VarKind::Output, 0).unwrap();
        first.var_mut(out0).kind = VarKind::Temp;
        first.var_mut(out0).id = -1;

        let mut varmap = HashMap::new();
        varmap.insert(second.lookup_var(VarKind::Input, 0).unwrap(), out0);
        let in2 = first.variable(VarKind::Input, 2);
        varmap.insert(second.lookup_var(VarKind::Input, 1).unwrap(), in2);
        first.merge(&second, &varmap);
        first.compact_temp_vars();

        assert_eq!(first.as_recipe(), "@0=Mul(Add(%0,%1),%2)");
    }

    #[test]
    fn test_complexity() {
        let cost = CostModel::default();
        let expr = Express::from_recipe("$0=Add(%0,%1);@0=Id($0)").unwrap();
        assert_eq!(expr.complexity(&cost), cost.arithmetic);
        let expr = Express::from_recipe("@0=Div(%0,%1)").unwrap();
        assert_eq!(expr.complexity(&cost), cost.divide);
    }

    #[test]
    fn test_internal_reduction() {
        let expr = Express::from_recipe("@0=Sum(%0)").unwrap();
        assert!(!expr.has_internal_reduction());
        let expr = Express::from_recipe("$0=Sum(%0);@0=Add($0,%1)").unwrap();
        assert!(expr.has_internal_reduction());
    }
}
