//! Flow rewrite passes
//!
//! Transformers run before kernel selection and rewrite the flow graph:
//! algebraic simplification, constant folding, fusion of element-wise
//! operations into combined Calculate steps with a textual expression
//! recipe, and removal of dead expression inputs. Each pass works on a
//! snapshot of the candidate list; the graph is never mutated while being
//! iterated.

use crate::express::{Express, OpKind, VarKind, VarRef};
use crate::flow::{Flow, OpId, Shape, Transformer, VarId};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Map a flow operation type to an expression op kind. Operations in this
/// table can be folded into Calculate expressions.
pub fn expr_op(kind: &str) -> Option<OpKind> {
    Some(match kind {
        "Id" | "Identity" => OpKind::Mov,
        "Add" => OpKind::Add,
        "Sub" => OpKind::Sub,
        "Mul" => OpKind::Mul,
        "Div" => OpKind::Div,
        "Minimum" => OpKind::Min,
        "Maximum" => OpKind::Max,
        "Neg" => OpKind::Neg,
        "Relu" => OpKind::Relu,
        "Log" => OpKind::Log,
        "Exp" => OpKind::Exp,
        "Sigmoid" => OpKind::Sigmoid,
        "Tanh" => OpKind::Tanh,
        "Sqrt" => OpKind::Sqrt,
        "Rsqrt" => OpKind::Rsqrt,
        "Reciprocal" => OpKind::Reciprocal,
        "Equal" => OpKind::Eq,
        "NotEqual" => OpKind::Ne,
        "Less" => OpKind::Lt,
        "LessEqual" => OpKind::Le,
        "Greater" => OpKind::Gt,
        "GreaterEqual" => OpKind::Ge,
        "And" => OpKind::And,
        "Or" => OpKind::Or,
        "Xor" => OpKind::Xor,
        "Not" => OpKind::Not,
        "AndNot" => OpKind::AndNot,
        "Select" => OpKind::Cond,
        "Sum" => OpKind::Sum,
        "Max" => OpKind::MaxRed,
        "Min" => OpKind::MinRed,
        _ => return None,
    })
}

/// Check if an operation can be part of a Calculate expression.
pub fn is_calculate_op(flow: &Flow, op: OpId) -> bool {
    let kind = flow.ops[op].kind.as_str();
    kind == "Calculate" || kind == "Assign" || expr_op(kind).is_some()
}

/// Build the expression computed by a flow operation.
pub fn init_expression(flow: &Flow, op: OpId) -> Option<Express> {
    let operation = &flow.ops[op];
    let mut expr = Express::new();
    match operation.kind.as_str() {
        "Calculate" | "Assign" => {
            if let Some(recipe) = operation.attr("expr") {
                if expr.parse(recipe).is_err() {
                    return None;
                }
            } else if operation.kind == "Assign" && operation.inputs.len() == 2 {
                // Plain assignment: target = value.
                if expr.parse("@0=Id(%1)").is_err() {
                    return None;
                }
            }
        }
        kind => {
            let opkind = expr_op(kind)?;
            if operation.outputs.len() != 1 {
                return None;
            }
            let args: Vec<VarRef> = (0..operation.inputs.len())
                .map(|i| expr.variable(VarKind::Input, i as i32))
                .collect();
            let func = expr.operation(opkind);
            for arg in args {
                expr.add_argument(func, arg);
            }
            let out = expr.variable(VarKind::Output, 0);
            expr.assign(func, out);
            expr.compact_temp_vars();
        }
    }

    // Mark constant inputs.
    for (i, &input) in operation.inputs.iter().enumerate() {
        if flow.vars[input].constant() {
            if let Some(r) = expr.lookup_var(VarKind::Input, i as i32) {
                expr.var_mut(r).kind = VarKind::Const;
            }
        }
    }
    Some(expr)
}

/// Map flow variables to expression variables for an operation. Input and
/// constant variables share the input index space.
fn map_vars(flow: &Flow, op: OpId, expr: &mut Express) -> HashMap<VarId, VarRef> {
    let mut varmap = HashMap::new();
    for (i, &input) in flow.ops[op].inputs.iter().enumerate() {
        let kind = if flow.vars[input].constant() {
            VarKind::Const
        } else {
            VarKind::Input
        };
        varmap.insert(input, expr.variable(kind, i as i32));
    }
    for (j, &output) in flow.ops[op].outputs.iter().enumerate() {
        varmap.insert(output, expr.variable(VarKind::Output, j as i32));
    }
    varmap
}

/// Algebraic simplification of element-wise operations. Every fold only
/// fires when the folded intermediate has exactly one consumer and is not a
/// declared output.
pub struct Simplifier;

impl Simplifier {
    fn foldable(flow: &Flow, var: VarId) -> bool {
        flow.vars[var].consumers.len() == 1 && !flow.vars[var].output
    }

    fn const_scalar(flow: &Flow, var: VarId) -> Option<f32> {
        let v = &flow.vars[var];
        if !v.constant() || v.elements() != 1 {
            return None;
        }
        v.data_f32().and_then(|d| d.first().copied())
    }

    /// Complementary comparison for negation.
    fn complement(kind: &str) -> Option<&'static str> {
        Some(match kind {
            "Equal" => "NotEqual",
            "NotEqual" => "Equal",
            "Less" => "GreaterEqual",
            "GreaterEqual" => "Less",
            "Greater" => "LessEqual",
            "LessEqual" => "Greater",
            _ => return None,
        })
    }

    fn try_simplify(&self, flow: &mut Flow, op: OpId) -> bool {
        let kind = flow.ops[op].kind.clone();
        match kind.as_str() {
            "Div" if flow.ops[op].inputs.len() == 2 => {
                let num = flow.ops[op].inputs[0];
                let denom = flow.ops[op].inputs[1];
                if Self::const_scalar(flow, num) == Some(1.0) {
                    // Div(1,x) -> Reciprocal(x)
                    flow.remove_input(op, num);
                    flow.ops[op].kind = "Reciprocal".to_string();
                    return true;
                }
                if let Some(c) = Self::const_scalar(flow, denom) {
                    if c != 0.0 {
                        // Div(x,c) -> Mul(x,1/c)
                        let name = format!("{}_recip", flow.vars[denom].name);
                        let recip = flow.add_const_f32(&name, Shape::scalar(), &[1.0 / c]);
                        flow.replace_input(op, 1, recip);
                        flow.ops[op].kind = "Mul".to_string();
                        return true;
                    }
                }
                false
            }
            "Reciprocal" if flow.ops[op].inputs.len() == 1 => {
                // Reciprocal(Sqrt(x)) -> Rsqrt(x)
                let arg = flow.ops[op].inputs[0];
                if !Self::foldable(flow, arg) {
                    return false;
                }
                let producer = match flow.vars[arg].producer {
                    Some(p) if flow.ops[p].kind == "Sqrt" => p,
                    _ => return false,
                };
                let x = flow.ops[producer].inputs[0];
                flow.replace_input(op, 0, x);
                flow.ops[op].kind = "Rsqrt".to_string();
                flow.delete_op(producer);
                flow.delete_var(arg);
                true
            }
            "Not" if flow.ops[op].inputs.len() == 1 => {
                let arg = flow.ops[op].inputs[0];
                if !Self::foldable(flow, arg) {
                    return false;
                }
                let producer = match flow.vars[arg].producer {
                    Some(p) => p,
                    None => return false,
                };
                let inner = flow.ops[producer].kind.clone();
                if inner == "Not" {
                    // Not(Not(x)) -> x
                    let x = flow.ops[producer].inputs[0];
                    flow.replace_input(op, 0, x);
                    flow.ops[op].kind = "Id".to_string();
                    flow.delete_op(producer);
                    flow.delete_var(arg);
                    return true;
                }
                if let Some(complement) = Self::complement(&inner) {
                    // Not(cmp(a,b)) -> complementary cmp(a,b)
                    let a = flow.ops[producer].inputs[0];
                    let b = flow.ops[producer].inputs[1];
                    flow.remove_input(op, arg);
                    flow.ops[op].inputs.clear();
                    flow.ops[op].inputs.push(a);
                    flow.vars[a].consumers.push(op);
                    flow.ops[op].inputs.push(b);
                    flow.vars[b].consumers.push(op);
                    flow.ops[op].kind = complement.to_string();
                    flow.delete_op(producer);
                    flow.delete_var(arg);
                    return true;
                }
                false
            }
            "And" if flow.ops[op].inputs.len() == 2 => {
                // And(Not(x),y) -> AndNot(x,y); And(x,Not(y)) -> AndNot(y,x)
                for argno in 0..2 {
                    let arg = flow.ops[op].inputs[argno];
                    if !Self::foldable(flow, arg) {
                        continue;
                    }
                    let producer = match flow.vars[arg].producer {
                        Some(p) if flow.ops[p].kind == "Not" => p,
                        _ => continue,
                    };
                    let x = flow.ops[producer].inputs[0];
                    let other = flow.ops[op].inputs[1 - argno];
                    flow.remove_input(op, arg);
                    flow.remove_input(op, other);
                    flow.ops[op].inputs.clear();
                    flow.ops[op].inputs.push(x);
                    flow.vars[x].consumers.push(op);
                    flow.ops[op].inputs.push(other);
                    flow.vars[other].consumers.push(op);
                    flow.ops[op].kind = "AndNot".to_string();
                    flow.delete_op(producer);
                    flow.delete_var(arg);
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

impl Transformer for Simplifier {
    fn transform(&self, flow: &mut Flow) -> bool {
        let mut changed = false;
        for op in flow.live_ops() {
            if flow.ops[op].dead {
                continue;
            }
            if self.try_simplify(flow, op) {
                changed = true;
            }
        }
        changed
    }
}

/// Fold operations whose inputs are all constant into new constants.
pub struct ConstantFolder;

impl ConstantFolder {
    fn try_fold(&self, flow: &mut Flow, op: OpId) -> bool {
        if flow.ops[op].kind == "Calculate" || flow.ops[op].kind == "Assign" {
            return false;
        }
        if expr_op(&flow.ops[op].kind).is_none() {
            return false;
        }
        if flow.ops[op].outputs.len() != 1 {
            return false;
        }
        let output = flow.ops[op].outputs[0];
        if flow.vars[output].output {
            return false;
        }
        let inputs = flow.ops[op].inputs.clone();
        if inputs.is_empty() || !inputs.iter().all(|&v| flow.vars[v].constant()) {
            return false;
        }
        let data: Vec<Vec<f32>> = match inputs
            .iter()
            .map(|&v| flow.vars[v].data_f32())
            .collect::<Option<Vec<_>>>()
        {
            Some(d) => d,
            None => return false,
        };
        let expr = match init_expression(flow, op) {
            Some(e) => e,
            None => return false,
        };

        let elements = flow.vars[output].elements().max(1) as usize;
        let mut result = vec![0.0f32; elements];
        let mut consts = vec![0.0f32; inputs.len()];
        let mut out = [0.0f32];
        for e in 0..elements {
            for (i, values) in data.iter().enumerate() {
                consts[i] = if values.len() == 1 { values[0] } else { values[e] };
            }
            if expr.evaluate(&[], &consts, &mut out).is_err() {
                return false;
            }
            result[e] = out[0];
        }

        // Replace the op with constant data on its output variable.
        let mut bytes = Vec::with_capacity(result.len() * 4);
        for v in &result {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        flow.delete_op(op);
        flow.vars[output].data = Some(bytes);
        for &input in &inputs {
            if flow.vars[input].consumers.is_empty() && !flow.vars[input].output {
                flow.vars[input].dead = true;
            }
        }
        true
    }
}

impl Transformer for ConstantFolder {
    fn transform(&self, flow: &mut Flow) -> bool {
        let mut changed = false;
        for op in flow.live_ops() {
            if !flow.ops[op].dead && self.try_fold(flow, op) {
                changed = true;
            }
        }
        changed
    }
}

/// Combine element-wise operations into fused Calculate operations with a
/// merged expression recipe.
pub struct ExpressionFuser;

impl ExpressionFuser {
    /// Check type and shape compatibility and dependency safety, then fuse.
    fn combine(&self, flow: &mut Flow, first: OpId, second: OpId) -> bool {
        if flow.ops[first].inputs.is_empty() || flow.ops[first].outputs.is_empty() {
            return false;
        }
        if flow.ops[second].inputs.is_empty() {
            return false;
        }
        // Only operations in the same function and task can fuse.
        if flow.ops[first].func != flow.ops[second].func
            || flow.ops[first].task != flow.ops[second].task
        {
            return false;
        }

        let out0 = flow.ops[first].outputs[0];
        let dtype = flow.vars[out0].dtype;
        let shape = flow.vars[out0].shape.clone();
        for &v in flow.ops[first].inputs.iter().chain(&flow.ops[second].inputs) {
            if flow.vars[v].dtype != dtype {
                return false;
            }
            if !flow.vars[v].shape.compatible(&shape) {
                return false;
            }
        }
        for &v in flow.ops[first].outputs.iter().chain(&flow.ops[second].outputs) {
            if flow.vars[v].dtype != dtype || flow.vars[v].shape != shape {
                return false;
            }
        }

        // No indirect dependencies between the ops.
        for &v in &flow.ops[second].inputs.clone() {
            if flow.vars[v].producer != Some(first) && flow.depends_on(v, first) {
                return false;
            }
        }
        for &v in &flow.ops[first].inputs.clone() {
            if flow.depends_on(v, second) {
                return false;
            }
        }

        let recipe = match self.fuse_expressions(flow, first, second) {
            Some(r) => r,
            None => return false,
        };

        let kind = if flow.ops[second].kind == "Assign" {
            "Assign"
        } else {
            "Calculate"
        };
        let fused = flow.fuse(first, second, kind);
        flow.ops[fused].set_attr("expr", recipe);
        true
    }

    /// Merge the expressions of two operations, demoting internal variables
    /// to temporaries and renumbering the externals contiguously. Returns
    /// None when the merged expression would consume a reduction result
    /// internally.
    fn fuse_expressions(&self, flow: &Flow, first: OpId, second: OpId) -> Option<String> {
        let mut expr1 = init_expression(flow, first)?;
        let vars1 = map_vars(flow, first, &mut expr1);
        let mut expr2 = init_expression(flow, second)?;
        let vars2 = map_vars(flow, second, &mut expr2);

        let mut mapping: HashMap<VarRef, VarRef> = HashMap::new();
        let mut next_input = flow.ops[first].inputs.len() as i32;
        let mut next_output = flow.ops[first].outputs.len() as i32;
        for &v in &flow.ops[second].inputs {
            if flow.ops[first].is_input(v) {
                mapping.insert(vars2[&v], vars1[&v]);
            } else if flow.ops[first].is_output(v) {
                if flow.vars[v].consumers.len() == 1 && !flow.vars[v].output {
                    // The second op is the only consumer, so the variable
                    // becomes a temporary in the fused expression.
                    let r = vars1[&v];
                    let old_id = expr1.var(r).id;
                    expr1.var_mut(r).kind = VarKind::Temp;
                    expr1.var_mut(r).id = -1;
                    next_output -= 1;
                    for o in expr1.live_vars() {
                        if expr1.var(o).kind == VarKind::Output && expr1.var(o).id > old_id {
                            expr1.var_mut(o).id -= 1;
                        }
                    }
                }
                mapping.insert(vars2[&v], vars1[&v]);
            } else {
                let kind = if flow.vars[v].constant() {
                    VarKind::Const
                } else {
                    VarKind::Input
                };
                let target = expr1.variable(kind, next_input);
                next_input += 1;
                mapping.insert(vars2[&v], target);
            }
        }
        for &v in &flow.ops[second].outputs {
            let target = expr1.variable(VarKind::Output, next_output);
            next_output += 1;
            mapping.insert(vars2[&v], target);
        }

        expr1.merge(&expr2, &mapping);
        expr1.compact_temp_vars();

        // A reduction result cannot be an input inside a fused expression.
        if expr1.has_internal_reduction() {
            return None;
        }
        Some(expr1.as_recipe())
    }
}

impl Transformer for ExpressionFuser {
    fn transform(&self, flow: &mut Flow) -> bool {
        // Snapshot the candidate list for this round.
        let mut candidates: Vec<Option<OpId>> = flow
            .live_ops()
            .into_iter()
            .filter(|&op| is_calculate_op(flow, op))
            .map(Some)
            .collect();
        let total = candidates.len();

        let mut combines = 0;
        let mut again = true;
        while again {
            again = false;
            for i in 0..candidates.len() {
                let op = match candidates[i] {
                    Some(op) if !flow.ops[op].dead => op,
                    _ => continue,
                };
                // Try to combine with the producer of one of the inputs.
                let inputs = flow.ops[op].inputs.clone();
                for input in inputs {
                    let producer = match flow.vars[input].producer {
                        Some(p) => p,
                        None => continue,
                    };
                    if !is_calculate_op(flow, producer) {
                        continue;
                    }
                    if self.combine(flow, producer, op) {
                        candidates[i] = None;
                        combines += 1;
                        again = true;
                        break;
                    }
                }
                if again {
                    break;
                }
                // Try to combine with a sibling sharing a non-constant input.
                let inputs = flow.ops[op].inputs.clone();
                for input in inputs {
                    if flow.vars[input].constant() {
                        continue;
                    }
                    let sibling = flow.vars[input]
                        .consumers
                        .iter()
                        .copied()
                        .find(|&c| c != op && !flow.ops[c].dead && is_calculate_op(flow, c));
                    let sibling = match sibling {
                        Some(s) => s,
                        None => continue,
                    };
                    if flow.ops[sibling].func != flow.ops[op].func {
                        continue;
                    }
                    if self.combine(flow, op, sibling) {
                        candidates[i] = None;
                        combines += 1;
                        again = true;
                        break;
                    }
                }
                if again {
                    break;
                }
            }
        }
        debug!(combines, candidates = total, "expression fusion");
        false
    }
}

/// Remove fused operation inputs that are no longer referenced by the
/// expression recipe, renumbering the remaining inputs contiguously.
pub struct DeadInputRemover;

impl DeadInputRemover {
    fn prune(&self, flow: &mut Flow, op: OpId) -> bool {
        let recipe = match flow.ops[op].attr("expr") {
            Some(r) => r.to_string(),
            None => return false,
        };
        let mut expr = match Express::from_recipe(&recipe) {
            Ok(e) => e,
            Err(_) => return false,
        };
        let used: HashSet<i32> = expr
            .live_vars()
            .into_iter()
            .filter(|&v| matches!(expr.var(v).kind, VarKind::Input | VarKind::Const))
            .map(|v| expr.var(v).id)
            .collect();

        let arity = flow.ops[op].inputs.len();
        let mut changed = false;
        for i in (0..arity).rev() {
            if used.contains(&(i as i32)) {
                continue;
            }
            let var = flow.ops[op].inputs[i];
            flow.remove_input(op, var);
            if flow.vars[var].consumers.is_empty()
                && flow.vars[var].producer.is_none()
                && !flow.vars[var].output
                && !flow.vars[var].input
            {
                flow.vars[var].dead = true;
            }
            // Renumber expression inputs above the removed index.
            for v in expr.live_vars() {
                let kind = expr.var(v).kind;
                if matches!(kind, VarKind::Input | VarKind::Const) && expr.var(v).id > i as i32 {
                    expr.var_mut(v).id -= 1;
                }
            }
            changed = true;
        }
        if changed {
            let new_recipe = expr.as_recipe();
            flow.ops[op].set_attr("expr", new_recipe);
        }
        changed
    }
}

impl Transformer for DeadInputRemover {
    fn transform(&self, flow: &mut Flow) -> bool {
        let mut changed = false;
        for op in flow.live_ops() {
            let kind = flow.ops[op].kind.as_str();
            if kind != "Calculate" && kind != "Assign" {
                continue;
            }
            if self.prune(flow, op) {
                changed = true;
            }
        }
        changed
    }
}
