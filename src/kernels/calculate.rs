//! Calculate kernel
//!
//! Lowers expression recipes and single element-wise operations to a
//! bounded calculation loop over instance memory. The expression is
//! optimized (common subexpression elimination, result caching, fused
//! multiply combining) and register allocated before lowering; scalar
//! operands are hoisted into registers in the loop prelude and reduction
//! accumulators are stored in the loop tail.

use crate::code::{CalcInstr, CalcOperand, Dst, Emitter, ExprStep, Instr, OperandKind, Src};
use crate::compiler::CompileError;
use crate::compute::{CompileOptions, Network, Order, Step, StepId, TensorId};
use crate::express::{reduction_identity, CostModel, Express, OpKind, VarKind, VarRef, NUMBER_VALUES};
use crate::flow::DataType;
use crate::kernel::{Kernel, KernelPlan, Library};
use crate::transform::expr_op;
use std::collections::HashMap;
use std::sync::Arc;

/// Kernel computing expression recipes and mappable element-wise
/// operations.
pub struct Calculate {
    name: &'static str,
    operation: &'static str,
}

/// Optimized expression with lowering resource counts.
struct Analysis {
    expr: Express,
    elements: usize,
    base_regs: usize,
    scalar_hoists: Vec<VarRef>,
    reduction_accs: usize,
}

fn invalid(step: &Step, reason: &str) -> CompileError {
    CompileError::InvalidExpression {
        step: step.name.clone(),
        reason: reason.to_string(),
    }
}

/// Operand index for an immediate number, reusing existing entries.
fn number_operand(calc: &mut CalcInstr, value: f32) -> u16 {
    let found = calc
        .operands
        .iter()
        .position(|o| matches!(o.kind, OperandKind::Number { value: v } if v == value));
    if let Some(i) = found {
        return i as u16;
    }
    calc.operands.push(CalcOperand {
        kind: OperandKind::Number { value },
        scalar: true,
    });
    (calc.operands.len() - 1) as u16
}

impl Calculate {
    /// Build the expression computed by a step. Fused steps carry a recipe
    /// attribute; simple steps compute a single operation over their
    /// inputs. Constant inputs are retyped so they can bind to constant
    /// tensor data.
    fn build_expression(&self, step: StepId, net: &Network) -> Result<Express, CompileError> {
        let s = net.step(step);
        let mut expr = Express::new();
        match s.kind.as_str() {
            "Calculate" | "Assign" => {
                if let Some(recipe) = s.attr("expr") {
                    expr.parse(recipe)?;
                } else if s.kind == "Assign" && s.inputs.len() == 2 {
                    expr.parse("@0=Id(%1)")?;
                } else {
                    return Err(invalid(s, "missing expression"));
                }
            }
            kind => {
                let opkind = expr_op(kind).ok_or_else(|| invalid(s, "unknown operation"))?;
                let args: Vec<VarRef> = (0..s.inputs.len())
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
        for (i, &input) in s.inputs.iter().enumerate() {
            if net.tensor(input).is_constant() {
                if let Some(r) = expr.lookup_var(VarKind::Input, i as i32) {
                    expr.var_mut(r).kind = VarKind::Const;
                }
            }
        }
        Ok(expr)
    }

    /// Optimize the step expression and compute register requirements.
    fn analyze(&self, step: StepId, net: &Network) -> Result<Analysis, CompileError> {
        let s = net.step(step);
        let mut expr = self.build_expression(step, net)?;
        expr.eliminate_common_subexpressions();
        expr.fuse_mul_add();
        expr.fuse_mul_sub();
        expr.cache_results();
        expr.compute_live_ranges();
        let base_regs = expr.allocate_registers();

        let mut elements = 1;
        for &t in s.inputs.iter().chain(&s.outputs) {
            elements = elements.max(net.tensor(t).elements());
        }

        // Broadcast scalars are loaded once in the loop prelude.
        let mut scalar_hoists = Vec::new();
        if elements > 1 {
            for v in expr.live_vars() {
                let var = expr.var(v);
                if !matches!(var.kind, VarKind::Input | VarKind::Const) {
                    continue;
                }
                if var.consumers.is_empty() {
                    continue;
                }
                let tensor = s
                    .inputs
                    .get(var.id as usize)
                    .copied()
                    .ok_or_else(|| invalid(s, "expression input out of range"))?;
                if net.tensor(tensor).elements() <= 1 {
                    scalar_hoists.push(v);
                }
            }
        }

        // Reductions writing directly to memory operands accumulate in an
        // extra register instead.
        let reduction_accs = expr
            .ops_in_order()
            .iter()
            .filter(|&&o| {
                let op = expr.op(o);
                op.kind.reduction()
                    && op
                        .result
                        .map(|r| expr.var(r).kind != VarKind::Temp)
                        .unwrap_or(false)
            })
            .count();

        Ok(Analysis {
            expr,
            elements,
            base_regs,
            scalar_hoists,
            reduction_accs,
        })
    }

    /// Memory operand for a tensor, following shared storage.
    fn tensor_operand(
        &self,
        net: &Network,
        step: &Step,
        id: TensorId,
    ) -> Result<CalcOperand, CompileError> {
        let root = net.storage_root(id);
        let tensor = net.tensor(root);
        let scalar = tensor.elements() <= 1;
        if !tensor.is_dense() {
            return Err(invalid(step, "padded tensor layout"));
        }
        if tensor.is_constant() {
            return Ok(CalcOperand {
                kind: OperandKind::Constant { tensor: root },
                scalar,
            });
        }
        let offset = tensor
            .offset
            .ok_or_else(|| invalid(step, "tensor has no instance offset"))?;
        let kind = if tensor.reference {
            OperandKind::InstanceRef { offset }
        } else {
            OperandKind::Instance { offset }
        };
        Ok(CalcOperand { kind, scalar })
    }
}

impl Kernel for Calculate {
    fn name(&self) -> &str {
        self.name
    }

    fn operation(&self) -> &str {
        self.operation
    }

    fn supports(&self, step: StepId, net: &Network) -> bool {
        let s = net.step(step);
        for &t in s.inputs.iter().chain(&s.outputs) {
            if net.tensor(t).dtype != DataType::Float32 {
                return false;
            }
        }
        let out = match s.outputs.first().or(s.inputs.first()) {
            Some(&t) => t,
            None => return false,
        };
        let elements = s
            .inputs
            .iter()
            .chain(&s.outputs)
            .map(|&t| net.tensor(t).elements())
            .max()
            .unwrap_or(1);
        for &t in &s.outputs {
            if net.tensor(t).shape != net.tensor(out).shape {
                return false;
            }
        }
        for &t in &s.inputs {
            let n = net.tensor(t).elements();
            if n != elements && n > 1 {
                return false;
            }
        }

        let expr = match self.build_expression(step, net) {
            Ok(e) => e,
            Err(_) => return false,
        };
        if expr.has_internal_reduction() {
            return false;
        }
        let reduces = expr.ops_in_order().iter().any(|&o| expr.op(o).kind.reduction());
        if net.tensor(out).elements() != elements && !reduces {
            return false;
        }
        for v in expr.live_vars() {
            let var = expr.var(v);
            match var.kind {
                VarKind::Input | VarKind::Const => {
                    if var.id as usize >= s.inputs.len() {
                        return false;
                    }
                }
                VarKind::Output => {
                    let j = var.id as usize;
                    let assigns = s.kind == "Assign" && j == 0 && !s.inputs.is_empty();
                    if j >= s.outputs.len() && !assigns {
                        return false;
                    }
                }
                VarKind::Number => {
                    if var.id as usize >= NUMBER_VALUES.len() {
                        return false;
                    }
                }
                VarKind::Temp => {}
            }
        }
        true
    }

    fn adjust(&self, step: StepId, net: &mut Network) -> Result<(), CompileError> {
        let inputs = net.step(step).inputs.clone();
        let outputs = net.step(step).outputs.clone();
        for &t in inputs.iter().chain(&outputs) {
            net.tensor_mut(t).require_order(Order::RowMajor);
            net.tensor_mut(t).min_byte_align(16);
        }
        if net.step(step).kind == "Assign" {
            return Ok(());
        }
        // Reuse input storage for a same-shaped output where possible.
        // Each input backs at most one output.
        for i in 0..inputs.len() {
            if net.tensor(inputs[i]).is_constant() {
                continue;
            }
            for j in 0..outputs.len() {
                let same_shape = net.tensor(inputs[i]).shape == net.tensor(outputs[j]).shape;
                if same_shape && net.allow_in_place(step, i, j) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn plan(
        &self,
        step: StepId,
        net: &Network,
        _options: &CompileOptions,
    ) -> Result<KernelPlan, CompileError> {
        let a = self.analyze(step, net)?;
        Ok(KernelPlan {
            registers: a.base_regs + a.scalar_hoists.len() + a.reduction_accs,
        })
    }

    fn generate(
        &self,
        step: StepId,
        net: &Network,
        options: &CompileOptions,
        emit: &mut Emitter,
    ) -> Result<(), CompileError> {
        let s = net.step(step);
        let a = self.analyze(step, net)?;
        let total = a.base_regs + a.scalar_hoists.len() + a.reduction_accs;
        emit.reserve_registers(total)
            .map_err(|e| CompileError::RegisterOverflow {
                needed: e.needed,
                available: e.available,
            })?;

        let mut calc = CalcInstr {
            elements: a.elements,
            regs: total,
            ..Default::default()
        };

        // Operand table for all external variables.
        let mut operand_of: HashMap<VarRef, u16> = HashMap::new();
        for v in a.expr.live_vars() {
            let var = a.expr.var(v);
            let tensor = match var.kind {
                VarKind::Input | VarKind::Const => s.inputs[var.id as usize],
                VarKind::Output => {
                    let j = var.id as usize;
                    if j < s.outputs.len() {
                        s.outputs[j]
                    } else {
                        s.inputs[0]
                    }
                }
                VarKind::Number => {
                    let value = *NUMBER_VALUES
                        .get(var.id as usize)
                        .ok_or_else(|| invalid(s, "unknown number constant"))?;
                    let idx = number_operand(&mut calc, value);
                    operand_of.insert(v, idx);
                    continue;
                }
                VarKind::Temp => continue,
            };
            let operand = self.tensor_operand(net, s, tensor)?;
            operand_of.insert(v, calc.operands.len() as u16);
            calc.operands.push(operand);
        }

        // Hoist broadcast scalars into registers in the prelude.
        let mut next_reg = a.base_regs as u8;
        let mut reg_of: HashMap<VarRef, u8> = HashMap::new();
        for &v in &a.scalar_hoists {
            let r = next_reg;
            next_reg += 1;
            calc.prelude.push(ExprStep {
                kind: OpKind::Mov,
                dst: Dst::Reg(r),
                args: [Src::Operand(operand_of[&v]), Src::None, Src::None],
            });
            reg_of.insert(v, r);
        }

        for &o in a.expr.ops_in_order() {
            let op = a.expr.op(o).clone();
            let result = op.result.ok_or_else(|| invalid(s, "operation without result"))?;
            let dst = if a.expr.var(result).kind == VarKind::Temp {
                let r = op.dst as u8;
                reg_of.insert(result, r);
                if op.kind.reduction() {
                    let idx = number_operand(&mut calc, reduction_identity(op.kind));
                    calc.prelude.push(ExprStep {
                        kind: OpKind::Mov,
                        dst: Dst::Reg(r),
                        args: [Src::Operand(idx), Src::None, Src::None],
                    });
                }
                Dst::Reg(r)
            } else if op.kind.reduction() {
                // Accumulate in a register and store after the loop.
                let r = next_reg;
                next_reg += 1;
                let idx = number_operand(&mut calc, reduction_identity(op.kind));
                calc.prelude.push(ExprStep {
                    kind: OpKind::Mov,
                    dst: Dst::Reg(r),
                    args: [Src::Operand(idx), Src::None, Src::None],
                });
                calc.tail.push(ExprStep {
                    kind: OpKind::Mov,
                    dst: Dst::Operand(operand_of[&result]),
                    args: [Src::Reg(r), Src::None, Src::None],
                });
                Dst::Reg(r)
            } else {
                Dst::Operand(operand_of[&result])
            };

            let mut args = [Src::None; 3];
            for (i, &arg) in op.args.iter().take(3).enumerate() {
                args[i] = if let Some(&r) = reg_of.get(&arg) {
                    Src::Reg(r)
                } else if let Some(&x) = operand_of.get(&arg) {
                    Src::Operand(x)
                } else {
                    return Err(invalid(s, "unbound expression argument"));
                };
            }
            calc.body.push(ExprStep {
                kind: op.kind,
                dst,
                args,
            });
        }

        if options.profiling {
            let cell = net.cell(s.cell);
            if let (Some(profile), Some(pos)) =
                (cell.profile, cell.steps.iter().position(|&x| x == step))
            {
                if let Some(offset) = net.tensor(profile).offset {
                    // Slot 0 holds the invocation count.
                    calc.profile_offset = Some(offset + 8 * (1 + pos));
                }
            }
        }

        emit.emit(Instr::Calc(calc));
        Ok(())
    }

    fn complexity(&self, step: StepId, net: &Network, cost: &CostModel) -> u64 {
        match self.analyze(step, net) {
            Ok(a) => a.elements as u64 * a.expr.complexity(cost),
            Err(_) => 0,
        }
    }
}

static CALCULATE_KERNELS: &[(&str, &str)] = &[
    ("Calculate", "Calculate"),
    ("Assign", "Assign"),
    ("IdExpr", "Id"),
    ("AddExpr", "Add"),
    ("SubExpr", "Sub"),
    ("MulExpr", "Mul"),
    ("DivExpr", "Div"),
    ("MinExpr", "Minimum"),
    ("MaxExpr", "Maximum"),
    ("NegExpr", "Neg"),
    ("ReluExpr", "Relu"),
    ("LogExpr", "Log"),
    ("ExpExpr", "Exp"),
    ("SigmoidExpr", "Sigmoid"),
    ("TanhExpr", "Tanh"),
    ("SqrtExpr", "Sqrt"),
    ("RsqrtExpr", "Rsqrt"),
    ("ReciprocalExpr", "Reciprocal"),
    ("EqualExpr", "Equal"),
    ("NotEqualExpr", "NotEqual"),
    ("LessExpr", "Less"),
    ("LessEqualExpr", "LessEqual"),
    ("GreaterExpr", "Greater"),
    ("GreaterEqualExpr", "GreaterEqual"),
    ("AndExpr", "And"),
    ("OrExpr", "Or"),
    ("XorExpr", "Xor"),
    ("NotExpr", "Not"),
    ("AndNotExpr", "AndNot"),
    ("SelectExpr", "Select"),
    ("SumExpr", "Sum"),
    ("MaxRedExpr", "Max"),
    ("MinRedExpr", "Min"),
];

/// Register the Calculate kernel family.
pub fn register(library: &mut Library) {
    for &(name, operation) in CALCULATE_KERNELS {
        library.register(Arc::new(Calculate { name, operation }));
    }
}
