//! Generated code objects
//!
//! A compiled cell holds a `Program`: a compact register-machine instruction
//! stream produced by the kernel generators and executed by a dispatch loop
//! over the raw instance block. The main entry starts at pc 0; each task has
//! its own entry point recorded in the cell task table. Every section ends
//! with a `Ret` instruction.

use crate::compute::{CellId, Network, TensorId};
use crate::express::{reduction_identity, scalar_op, OpKind};
use crate::runtime::{DevicePtr, RuntimeError, TaskCtx, TaskHandle};
use std::fmt::Write as _;
use std::path::Path;

/// Number of expression registers available to a kernel.
pub const NUM_REGISTERS: usize = 16;

/// Memory operand for a calculation instruction.
#[derive(Debug, Clone)]
pub enum OperandKind {
    /// Data inline in the instance block.
    Instance { offset: usize },
    /// Data reached through a pointer stored in the instance block, used
    /// for reference tensors bound to channel elements.
    InstanceRef { offset: usize },
    /// Constant tensor data owned by the network.
    Constant { tensor: TensorId },
    /// Immediate number.
    Number { value: f32 },
}

#[derive(Debug, Clone)]
pub struct CalcOperand {
    pub kind: OperandKind,
    /// Broadcast scalar; always read at element zero.
    pub scalar: bool,
}

/// Operand source for an expression step.
#[derive(Debug, Clone, Copy)]
pub enum Src {
    None,
    Reg(u8),
    Operand(u16),
}

/// Destination for an expression step.
#[derive(Debug, Clone, Copy)]
pub enum Dst {
    Reg(u8),
    Operand(u16),
}

/// One lowered expression operation.
#[derive(Debug, Clone)]
pub struct ExprStep {
    pub kind: OpKind,
    pub dst: Dst,
    pub args: [Src; 3],
}

/// Element-wise calculation over instance memory: a bounded loop applying
/// the expression steps to every element position. Scalar loads and
/// reduction accumulators run in the prelude; reduction stores run in the
/// tail after the loop.
#[derive(Debug, Clone, Default)]
pub struct CalcInstr {
    pub elements: usize,
    pub operands: Vec<CalcOperand>,
    pub prelude: Vec<ExprStep>,
    pub body: Vec<ExprStep>,
    pub tail: Vec<ExprStep>,
    pub regs: usize,
    /// Instance offset of the per-step tick counter when profiling.
    pub profile_offset: Option<usize>,
}

/// Transfer direction between host and device instance blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    ToHost,
}

/// One contiguous copy region between the host and device instance blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBlock {
    pub host_offset: usize,
    pub device_offset: usize,
    pub size: usize,
    pub task_index: Option<usize>,
}

/// Merge transfers of consecutive instance blocks into a minimal set of
/// contiguous copy regions. Blocks merge when they are adjacent in both the
/// host and device blocks and belong to the same task.
pub fn merge_transfers(mut blocks: Vec<TransferBlock>) -> Vec<TransferBlock> {
    blocks.sort_by_key(|b| (b.task_index, b.host_offset));
    let mut merged: Vec<TransferBlock> = Vec::with_capacity(blocks.len());
    for block in blocks {
        if let Some(last) = merged.last_mut() {
            if last.task_index == block.task_index
                && last.host_offset + last.size == block.host_offset
                && last.device_offset + last.size == block.device_offset
            {
                last.size += block.size;
                continue;
            }
        }
        merged.push(block);
    }
    merged
}

/// Program instruction.
#[derive(Debug, Clone)]
pub enum Instr {
    Calc(CalcInstr),
    /// Launch a task at its entry point.
    StartTask { index: usize },
    /// Wait for a started task to complete.
    WaitTask { index: usize },
    /// Wait for asynchronous work on the main path.
    SyncMain,
    /// Copy coalesced regions between host and device instance blocks.
    Transfer {
        direction: Direction,
        blocks: Vec<TransferBlock>,
    },
    /// End of a program section.
    Ret,
}

/// Generated code for a cell.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instrs: Vec<Instr>,
}

impl Program {
    /// Instruction listing in text form.
    pub fn listing(&self) -> String {
        let mut str = String::new();
        for (pc, instr) in self.instrs.iter().enumerate() {
            let _ = write!(str, "  {:4} ", pc);
            match instr {
                Instr::Calc(calc) => {
                    let _ = writeln!(
                        str,
                        "calc elements={} regs={} ops={}",
                        calc.elements,
                        calc.regs,
                        calc.prelude.len() + calc.body.len() + calc.tail.len()
                    );
                    for step in calc
                        .prelude
                        .iter()
                        .chain(calc.body.iter())
                        .chain(calc.tail.iter())
                    {
                        let _ = writeln!(str, "         {}", format_step(step));
                    }
                }
                Instr::StartTask { index } => {
                    let _ = writeln!(str, "start task {}", index);
                }
                Instr::WaitTask { index } => {
                    let _ = writeln!(str, "wait task {}", index);
                }
                Instr::SyncMain => {
                    let _ = writeln!(str, "sync main");
                }
                Instr::Transfer { direction, blocks } => {
                    let dir = match direction {
                        Direction::ToDevice => "copy to device",
                        Direction::ToHost => "copy to host",
                    };
                    let _ = writeln!(str, "{} ({} blocks)", dir, blocks.len());
                    for b in blocks {
                        let _ = writeln!(
                            str,
                            "         host {:#x} <-> device {:#x} size {}",
                            b.host_offset, b.device_offset, b.size
                        );
                    }
                }
                Instr::Ret => {
                    let _ = writeln!(str, "ret");
                }
            }
        }
        str
    }

    /// Write the instruction listing to a file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.listing())
    }
}

fn format_src(src: &Src) -> String {
    match src {
        Src::None => String::new(),
        Src::Reg(r) => format!("r{}", r),
        Src::Operand(x) => format!("[{}]", x),
    }
}

fn format_step(step: &ExprStep) -> String {
    let dst = match step.dst {
        Dst::Reg(r) => format!("r{}", r),
        Dst::Operand(x) => format!("[{}]", x),
    };
    let args: Vec<String> = step
        .args
        .iter()
        .filter(|a| !matches!(a, Src::None))
        .map(format_src)
        .collect();
    format!("{} {},{}", step.kind.name(), dst, args.join(","))
}

/// Code emitter used by kernel generators.
pub struct Emitter {
    instrs: Vec<Instr>,
    register_budget: usize,
    max_used: usize,
}

impl Emitter {
    pub fn new(register_budget: usize) -> Emitter {
        Emitter {
            instrs: Vec::new(),
            register_budget,
            max_used: 0,
        }
    }

    /// Current program counter.
    pub fn pc(&self) -> usize {
        self.instrs.len()
    }

    pub fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    /// Claim registers for the next instruction. Exceeding the register
    /// file is a fatal compile error; there is no degradation path.
    pub fn reserve_registers(&mut self, count: usize) -> Result<(), RegisterOverflow> {
        if count > self.register_budget {
            return Err(RegisterOverflow {
                needed: count,
                available: self.register_budget,
            });
        }
        if count > self.max_used {
            self.max_used = count;
        }
        Ok(())
    }

    pub fn register_usage(&self) -> usize {
        self.max_used
    }

    pub fn finish(self) -> Program {
        Program {
            instrs: self.instrs,
        }
    }
}

/// Register file exhaustion during code generation.
#[derive(Debug, Clone, Copy)]
pub struct RegisterOverflow {
    pub needed: usize,
    pub available: usize,
}

// ----------------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------------

/// Run the main section of a cell program over an instance block.
pub fn execute(
    net: &Network,
    cell: CellId,
    data: *mut u8,
    device: DevicePtr,
) -> Result<(), RuntimeError> {
    let c = &net.cells[cell];
    if let Some(profile) = c.profile {
        if let Some(offset) = net.tensors[profile].offset {
            unsafe {
                let p = data.add(offset) as *mut i64;
                *p += 1;
            }
        }
    }
    let mut handles: Vec<Option<TaskHandle>> = c.tasks.iter().map(|_| None).collect();
    let result = run_section(net, cell, data, device, 0, &mut handles);
    // Join any tasks still outstanding, even on error paths.
    for handle in handles.iter_mut() {
        if let Some(h) = handle.take() {
            let _ = net.runtime.wait_task(h);
        }
    }
    result
}

fn run_section(
    net: &Network,
    cell: CellId,
    data: *mut u8,
    device: DevicePtr,
    entry: usize,
    handles: &mut Vec<Option<TaskHandle>>,
) -> Result<(), RuntimeError> {
    let program = &net.cells[cell].program;
    let mut pc = entry;
    loop {
        let instr = program
            .instrs
            .get(pc)
            .ok_or(RuntimeError::InvalidProgram(pc))?;
        pc += 1;
        match instr {
            Instr::Ret => return Ok(()),
            Instr::Calc(calc) => run_calc(net, data, calc)?,
            Instr::StartTask { index } => {
                let task = &net.cells[cell].tasks[*index];
                set_task_state(data, task.offset, 1);
                let ctx = TaskCtx {
                    net: net as *const Network,
                    cell,
                    data,
                    device,
                    entry: task.entry,
                };
                let handle = net.runtime.start_task(Box::new(move || {
                    // Capture the whole context so its Send impl applies.
                    let ctx = ctx;
                    let net = unsafe { &*ctx.net };
                    let mut inner: Vec<Option<TaskHandle>> = Vec::new();
                    run_section(net, ctx.cell, ctx.data, ctx.device, ctx.entry, &mut inner)
                }))?;
                handles[*index] = Some(handle);
            }
            Instr::WaitTask { index } => {
                let handle = handles[*index]
                    .take()
                    .ok_or(RuntimeError::TaskNotStarted(*index))?;
                net.runtime.wait_task(handle)?;
                let task = &net.cells[cell].tasks[*index];
                set_task_state(data, task.offset, 2);
            }
            Instr::SyncMain => net.runtime.sync_main()?,
            Instr::Transfer { direction, blocks } => {
                for block in blocks {
                    match direction {
                        Direction::ToDevice => unsafe {
                            net.runtime.copy_to_device(
                                data.add(block.host_offset),
                                device,
                                block.device_offset,
                                block.size,
                            )?;
                        },
                        Direction::ToHost => unsafe {
                            net.runtime.copy_to_host(
                                device,
                                block.device_offset,
                                data.add(block.host_offset),
                                block.size,
                            )?;
                        },
                    }
                }
            }
        }
    }
}

fn set_task_state(data: *mut u8, offset: usize, state: u32) {
    unsafe {
        // State word is the third field of the task slot.
        std::ptr::write(data.add(offset + 8) as *mut u32, state);
    }
}

fn operand_base(net: &Network, data: *mut u8, operand: &CalcOperand) -> *const u8 {
    match &operand.kind {
        OperandKind::Instance { offset } => unsafe { data.add(*offset) as *const u8 },
        OperandKind::InstanceRef { offset } => unsafe {
            std::ptr::read(data.add(*offset) as *const *const u8)
        },
        OperandKind::Constant { tensor } => net.tensors[*tensor]
            .data
            .as_ref()
            .map(|d| d.as_ptr())
            .unwrap_or(std::ptr::null()),
        OperandKind::Number { .. } => std::ptr::null(),
    }
}

fn run_calc(net: &Network, data: *mut u8, calc: &CalcInstr) -> Result<(), RuntimeError> {
    let started = calc.profile_offset.map(|_| std::time::Instant::now());

    let bases: Vec<*const u8> = calc
        .operands
        .iter()
        .map(|op| operand_base(net, data, op))
        .collect();
    for (i, base) in bases.iter().enumerate() {
        if base.is_null() && !matches!(calc.operands[i].kind, OperandKind::Number { .. }) {
            return Err(RuntimeError::UnboundOperand(i));
        }
    }

    let mut regs = [0f32; NUM_REGISTERS * 2];

    let fetch = |regs: &[f32], src: &Src, element: usize| -> f32 {
        match src {
            Src::None => 0.0,
            Src::Reg(r) => regs[*r as usize],
            Src::Operand(x) => {
                let op = &calc.operands[*x as usize];
                if let OperandKind::Number { value } = op.kind {
                    return value;
                }
                let index = if op.scalar { 0 } else { element };
                unsafe { std::ptr::read((bases[*x as usize] as *const f32).add(index)) }
            }
        }
    };

    let store = |regs: &mut [f32], dst: &Dst, element: usize, value: f32| {
        match dst {
            Dst::Reg(r) => regs[*r as usize] = value,
            Dst::Operand(x) => {
                let op = &calc.operands[*x as usize];
                let index = if op.scalar { 0 } else { element };
                unsafe {
                    std::ptr::write((bases[*x as usize] as *mut f32).add(index), value);
                }
            }
        }
    };

    let eval = |regs: &mut [f32], step: &ExprStep, element: usize| {
        let a = fetch(regs, &step.args[0], element);
        let value = if step.kind.reduction() {
            // Accumulate into the destination register.
            let acc = match step.dst {
                Dst::Reg(r) => regs[r as usize],
                Dst::Operand(_) => reduction_identity(step.kind),
            };
            scalar_op(step.kind, acc, a, 0.0)
        } else {
            let b = fetch(regs, &step.args[1], element);
            let c = fetch(regs, &step.args[2], element);
            scalar_op(step.kind, a, b, c)
        };
        store(regs, &step.dst, element, value);
    };

    for step in &calc.prelude {
        eval(&mut regs, step, 0);
    }
    for element in 0..calc.elements {
        for step in &calc.body {
            eval(&mut regs, step, element);
        }
    }
    for step in &calc.tail {
        eval(&mut regs, step, 0);
    }

    if let (Some(offset), Some(start)) = (calc.profile_offset, started) {
        unsafe {
            let p = data.add(offset) as *mut i64;
            *p += start.elapsed().as_nanos() as i64;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(host: usize, dev: usize, size: usize) -> TransferBlock {
        TransferBlock {
            host_offset: host,
            device_offset: dev,
            size,
            task_index: None,
        }
    }

    #[test]
    fn test_merge_consecutive_transfers() {
        let blocks = vec![block(64, 0, 16), block(0, 0, 0), block(80, 16, 16)];
        let merged = merge_transfers(vec![blocks[0].clone(), blocks[2].clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].host_offset, 64);
        assert_eq!(merged[0].size, 32);
    }

    #[test]
    fn test_merge_keeps_gaps() {
        let merged = merge_transfers(vec![block(0, 0, 16), block(32, 16, 16)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_keeps_device_gaps() {
        // Adjacent on host but not on device.
        let merged = merge_transfers(vec![block(0, 0, 16), block(16, 64, 16)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_sorts_by_offset() {
        let merged = merge_transfers(vec![block(16, 16, 16), block(0, 0, 16)]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size, 32);
    }

    #[test]
    fn test_merge_respects_tasks() {
        let mut a = block(0, 0, 16);
        let mut b = block(16, 16, 16);
        a.task_index = Some(0);
        b.task_index = Some(1);
        let merged = merge_transfers(vec![a, b]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_task_closure_is_send() {
        fn require_send<T: Send>(_: &T) {}
        let ctx = TaskCtx {
            net: std::ptr::null(),
            cell: 0,
            data: std::ptr::null_mut(),
            device: 0,
            entry: 0,
        };
        // Mirrors the task launch closure: the whole context must be
        // captured so it can move to a worker thread.
        let task = move || {
            let ctx = ctx;
            ctx.entry
        };
        require_send(&task);
        assert_eq!(task(), 0);
    }

    #[test]
    fn test_emitter_register_budget() {
        let mut emit = Emitter::new(4);
        assert!(emit.reserve_registers(3).is_ok());
        assert_eq!(emit.register_usage(), 3);
        let err = emit.reserve_registers(5).unwrap_err();
        assert_eq!(err.needed, 5);
        assert_eq!(err.available, 4);
    }
}
