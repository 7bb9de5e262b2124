//! Network compiler
//!
//! Compiles an analyzed flow into a network of cells: kernel selection,
//! tensor layout, instance memory assignment, and code generation. The
//! library is taken by shared reference and cannot change during a compile.

use crate::code::{
    merge_transfers, Direction, Emitter, Instr, TransferBlock, NUM_REGISTERS,
};
use crate::compute::{
    Cell, CompileOptions, Connector, Network, Order, Placement, Step, StepId, TaskInfo,
    TaskState, Tensor, TensorId, CACHE_LINE_SIZE, TASK_SLOT_ALIGN, TASK_SLOT_SIZE,
};
use crate::express::ExprError;
use crate::flow::{DataType, Flow, FlowError, Shape, VarId};
use crate::kernel::Library;
use crate::runtime::{Runtime, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Compilation errors.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("no kernel for operation {op} of type {kind}")]
    UnsupportedOperation { op: String, kind: String },

    #[error("conflicting element order for tensor {0}")]
    ConflictingOrder(String),

    #[error("register overflow: needed {needed}, available {available}")]
    RegisterOverflow { needed: usize, available: usize },

    #[error("invalid expression for step {step}: {reason}")]
    InvalidExpression { step: String, reason: String },

    #[error("unsupported layout for tensor {0}")]
    UnsupportedLayout(String),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn align_up(offset: usize, align: usize) -> usize {
    let align = align.max(1);
    (offset + align - 1) / align * align
}

/// Compile a flow into a network for a runtime.
pub fn compile(
    mut flow: Flow,
    library: &Library,
    runtime: Arc<dyn Runtime>,
    options: CompileOptions,
) -> Result<Network, CompileError> {
    flow.analyze(library.transformers())?;
    let mut net = Network::new(runtime.clone(), options);

    let tensor_of = build_tensors(&flow, &mut net);
    build_connectors(&flow, &mut net, &tensor_of);
    build_cells(&flow, &mut net, &tensor_of);
    select_kernels(&mut net, library)?;
    adjust_steps(&mut net)?;
    propagate_link_alignment(&mut net);
    finalize_placement(&mut net);
    add_profile_tensors(&mut net);
    layout_tensors(&mut net)?;
    layout_instances(&mut net);
    prepare_constants(&mut net)?;
    generate_cells(&mut net)?;

    Ok(net)
}

/// Compile a flow loaded from a flow file.
pub fn compile_file(
    path: impl AsRef<std::path::Path>,
    library: &Library,
    runtime: Arc<dyn Runtime>,
    options: CompileOptions,
) -> Result<Network, CompileError> {
    let flow = Flow::load(path)?;
    compile(flow, library, runtime, options)
}

/// Create a tensor for every live flow variable.
fn build_tensors(flow: &Flow, net: &mut Network) -> HashMap<VarId, TensorId> {
    let mut tensor_of = HashMap::new();
    for (v, var) in flow.vars.iter().enumerate() {
        if var.dead {
            continue;
        }
        let mut tensor = Tensor::new(&var.name, var.dtype, var.shape.clone());
        tensor.aliases = var.aliases.clone();
        tensor.reference = var.reference;
        tensor.input = var.input;
        tensor.output = var.output;
        tensor.data = var.data.clone();
        let id = net.tensors.len();
        net.names.insert(tensor.name.clone(), id);
        net.tensors.push(tensor);
        tensor_of.insert(v, id);
    }
    tensor_of
}

/// Create connector prototypes and link the connected tensors to them.
fn build_connectors(flow: &Flow, net: &mut Network, tensor_of: &HashMap<VarId, TensorId>) {
    for cnx in &flow.cnxs {
        let first = match cnx.links.first().and_then(|v| tensor_of.get(v)) {
            Some(&t) => t,
            None => continue,
        };
        let mut prototype = Tensor::new(
            &cnx.name,
            net.tensors[first].dtype,
            net.tensors[first].shape.clone(),
        );
        // Channel elements start on cache line boundaries.
        prototype.min_byte_align(CACHE_LINE_SIZE);
        let proto_id = net.tensors.len();
        net.tensors.push(prototype);
        net.connectors.push(Connector {
            name: cnx.name.clone(),
            prototype: proto_id,
        });
        for v in &cnx.links {
            if let Some(&t) = tensor_of.get(v) {
                net.tensors[t].link = Some(proto_id);
            }
        }
    }
}

/// Create cells and steps from the flow functions, wiring tensor edges and
/// building the per-cell task tables.
fn build_cells(flow: &Flow, net: &mut Network, tensor_of: &HashMap<VarId, TensorId>) {
    let parallel = net.runtime.supports_async();
    for (f, func) in flow.funcs.iter().enumerate() {
        let cid = net.cells.len();
        let mut cell = Cell {
            name: func.name.clone(),
            func: f,
            steps: Vec::new(),
            tasks: Vec::new(),
            instance_size: 0,
            instance_alignment: 16,
            device_instance_size: 0,
            device_instance_alignment: 16,
            data_start: 0,
            register_usage: 0,
            program: Default::default(),
            profile: None,
        };
        for &op_id in &func.ops {
            let op = &flow.ops[op_id];
            if op.dead {
                continue;
            }
            let step_id = net.steps.len();
            let inputs: Vec<TensorId> = op.inputs.iter().map(|v| tensor_of[v]).collect();
            let outputs: Vec<TensorId> = op.outputs.iter().map(|v| tensor_of[v]).collect();
            for &t in &inputs {
                net.tensors[t].consumers.push(step_id);
                if net.tensors[t].cell.is_none() && !net.tensors[t].is_constant() {
                    net.tensors[t].cell = Some(cid);
                }
            }
            for &t in &outputs {
                net.tensors[t].producer = Some(step_id);
                if net.tensors[t].cell.is_none() {
                    net.tensors[t].cell = Some(cid);
                }
            }
            let task_index = if op.task != 0 && parallel {
                let index = cell.tasks.iter().position(|t| t.task == op.task);
                Some(index.unwrap_or_else(|| {
                    cell.tasks.push(TaskInfo {
                        task: op.task,
                        state: TaskState::Pending,
                        entry: 0,
                        offset: 0,
                        placement: Placement::NOWHERE,
                    });
                    cell.tasks.len() - 1
                }))
            } else {
                None
            };
            net.steps.push(Step {
                name: op.name.clone(),
                kind: op.kind.clone(),
                inputs,
                outputs,
                attrs: op.attrs.clone(),
                cell: cid,
                kernel: None,
                variant: String::new(),
                task_index,
                placement: Placement::NOWHERE,
            });
            cell.steps.push(step_id);
        }
        net.cells.push(cell);
    }
}

/// Select a kernel for each step. Candidates are tried in registration
/// order and the first supporting kernel wins. Placement propagates from
/// the kernel to the step's tensors.
fn select_kernels(net: &mut Network, library: &Library) -> Result<(), CompileError> {
    for step_id in 0..net.steps.len() {
        let kind = net.steps[step_id].kind.clone();
        let kernel = library
            .lookup(&kind)
            .iter()
            .find(|k| k.supports(step_id, net))
            .cloned()
            .ok_or_else(|| CompileError::UnsupportedOperation {
                op: net.steps[step_id].name.clone(),
                kind: kind.clone(),
            })?;
        debug!(step = %net.steps[step_id].name, kernel = kernel.name(), "selected kernel");
        let location = kernel.location();
        net.steps[step_id].variant = kernel.name().to_string();
        net.steps[step_id].kernel = Some(kernel);
        net.steps[step_id].placement = location;
        let tensors: Vec<TensorId> = net.steps[step_id]
            .inputs
            .iter()
            .chain(&net.steps[step_id].outputs)
            .copied()
            .collect();
        for t in tensors {
            net.tensors[t].placement.add(location);
        }
        if let Some(i) = net.steps[step_id].task_index {
            let cell = net.steps[step_id].cell;
            net.cells[cell].tasks[i].placement.add(location);
        }
    }
    Ok(())
}

/// Let each selected kernel add layout requirements to its tensors.
fn adjust_steps(net: &mut Network) -> Result<(), CompileError> {
    for step_id in 0..net.steps.len() {
        let kernel = net.steps[step_id]
            .kernel
            .clone()
            .ok_or_else(|| CompileError::UnsupportedOperation {
                op: net.steps[step_id].name.clone(),
                kind: net.steps[step_id].kind.clone(),
            })?;
        kernel.adjust(step_id, net)?;
    }
    Ok(())
}

/// Propagate alignment and order requirements across connector links. The
/// link graph is a star around each prototype, so a few rounds reach the
/// fixed point.
fn propagate_link_alignment(net: &mut Network) {
    for _ in 0..3 {
        for t in 0..net.tensors.len() {
            if let Some(link) = net.tensors[t].link {
                net.compatible_align(t, link);
            }
        }
    }
}

/// Cell inputs and outputs must be host visible; everything unplaced runs
/// on the host.
fn finalize_placement(net: &mut Network) {
    for tensor in net.tensors.iter_mut() {
        if tensor.input || tensor.output {
            tensor.placement.add(Placement::HOST);
        }
        if tensor.placement == Placement::NOWHERE {
            tensor.placement = Placement::HOST;
        }
    }
}

/// Add a per-cell profiling tensor: one invocation counter plus one tick
/// counter per step.
fn add_profile_tensors(net: &mut Network) {
    if !net.options.profiling {
        return;
    }
    for cid in 0..net.cells.len() {
        let name = format!("{}/profile", net.cells[cid].name);
        let slots = 1 + net.cells[cid].steps.len();
        let mut tensor = Tensor::new(&name, DataType::Int64, Shape::of(&[slots as i64]));
        tensor.cell = Some(cid);
        tensor.placement = Placement::HOST;
        let id = net.tensors.len();
        net.names.insert(name, id);
        net.tensors.push(tensor);
        net.cells[cid].profile = Some(id);
    }
}

/// Compute the element order, aligned shape, strides, and byte size of a
/// tensor.
fn layout_tensor(tensor: &mut Tensor, default_order: Order) -> Result<(), CompileError> {
    if tensor.required_order == Order::Conflicting {
        return Err(CompileError::ConflictingOrder(tensor.name.clone()));
    }
    tensor.order = match tensor.required_order {
        Order::Any => default_order,
        order => order,
    };
    let rank = tensor.rank();
    let mut dims = vec![0usize; rank];
    for d in 0..rank {
        let size = tensor.shape.dim(d);
        let size = if size < 0 { 1 } else { size as usize };
        let align = tensor.alignment[d].max(1);
        dims[d] = align_up(size.max(1), align);
    }
    tensor.aligned = Shape::of(&dims.iter().map(|&d| d as i64).collect::<Vec<_>>());
    tensor.stride = vec![0; rank];
    let esize = tensor.element_size();
    match tensor.order {
        Order::ColumnMajor => {
            let mut s = esize;
            for d in 0..rank {
                tensor.stride[d] = s;
                s *= dims[d];
            }
        }
        _ => {
            let mut s = esize;
            for d in (0..rank).rev() {
                tensor.stride[d] = s;
                s *= dims[d];
            }
        }
    }
    tensor.space = dims.iter().product::<usize>().max(1) * esize;
    Ok(())
}

fn layout_tensors(net: &mut Network) -> Result<(), CompileError> {
    let default_order = net.options.parameter_element_order;
    for tensor in net.tensors.iter_mut() {
        layout_tensor(tensor, default_order)?;
    }
    Ok(())
}

/// Assign instance offsets for each cell: runtime header, task slots, then
/// byte-aligned parameter data. Shared tensors reuse the storage of their
/// root; constants live outside instances.
fn layout_instances(net: &mut Network) {
    let header = net.runtime.extra_instance_data();
    for cid in 0..net.cells.len() {
        let mut offset = header;
        for i in 0..net.cells[cid].tasks.len() {
            offset = align_up(offset, TASK_SLOT_ALIGN);
            net.cells[cid].tasks[i].offset = offset;
            offset += TASK_SLOT_SIZE;
        }
        net.cells[cid].data_start = offset;

        let mut max_align = 16usize;
        for t in 0..net.tensors.len() {
            let tensor = &net.tensors[t];
            if tensor.cell != Some(cid)
                || tensor.is_constant()
                || tensor.shared.is_some()
                || !tensor.placement.has(Placement::HOST)
            {
                continue;
            }
            let (slot, align) = if tensor.reference {
                (std::mem::size_of::<*const u8>(), std::mem::align_of::<*const u8>())
            } else {
                (tensor.space, tensor.byte_alignment)
            };
            offset = align_up(offset, align);
            net.tensors[t].offset = Some(offset);
            offset += slot;
            max_align = max_align.max(align);
        }
        net.cells[cid].instance_size = offset;
        net.cells[cid].instance_alignment = max_align;

        // Shared tensors adopt the offset of their storage root.
        for t in 0..net.tensors.len() {
            if net.tensors[t].cell == Some(cid) && net.tensors[t].shared.is_some() {
                let root = net.storage_root(t);
                net.tensors[t].offset = net.tensors[root].offset;
            }
        }

        // Device instance block for device-placed parameters.
        let mut doffset = 0usize;
        let mut dmax_align = 16usize;
        for t in 0..net.tensors.len() {
            let tensor = &net.tensors[t];
            if tensor.cell != Some(cid)
                || tensor.is_constant()
                || tensor.shared.is_some()
                || !tensor.placement.has(Placement::DEVICE)
            {
                continue;
            }
            let align = tensor.byte_alignment;
            let space = tensor.space;
            doffset = align_up(doffset, align);
            net.tensors[t].device_offset = Some(doffset);
            doffset += space;
            dmax_align = dmax_align.max(align);
        }
        net.cells[cid].device_instance_size = doffset;
        net.cells[cid].device_instance_alignment = dmax_align;
    }
}

/// Convert constant data to the padded layout and upload device-placed
/// constants.
fn prepare_constants(net: &mut Network) -> Result<(), CompileError> {
    for t in 0..net.tensors.len() {
        let tensor = &net.tensors[t];
        let raw = match &tensor.data {
            Some(data) => data.clone(),
            None => continue,
        };
        let padded = if tensor.is_dense() || tensor.rank() <= 1 {
            let mut data = raw;
            data.resize(net.tensors[t].space.max(data.len()), 0);
            data
        } else if tensor.rank() == 2 {
            let rows = tensor.shape.dim(0) as usize;
            let row_bytes = tensor.shape.dim(1) as usize * tensor.element_size();
            let stride = tensor.stride[0];
            let mut data = vec![0u8; tensor.space];
            for r in 0..rows {
                data[r * stride..r * stride + row_bytes]
                    .copy_from_slice(&raw[r * row_bytes..(r + 1) * row_bytes]);
            }
            data
        } else {
            return Err(CompileError::UnsupportedLayout(tensor.name.clone()));
        };
        net.tensors[t].data = Some(padded);
        if net.tensors[t].placement.has(Placement::DEVICE) {
            let data = net.tensors[t].data.clone().unwrap_or_default();
            net.tensors[t].device_data = net.runtime.upload_constant(&data)?;
        }
    }
    Ok(())
}

/// Transfer blocks needed before running a step: device-produced inputs of
/// host steps move to the host, host-produced inputs of device steps move
/// to the device.
fn step_transfers(net: &Network, step: StepId, direction: Direction) -> Vec<TransferBlock> {
    let s = &net.steps[step];
    let mut blocks = Vec::new();
    for &input in &s.inputs {
        let tensor = &net.tensors[input];
        let produced_on_device = tensor
            .producer
            .map(|p| !net.steps[p].placement.has(Placement::HOST))
            .unwrap_or(false);
        let wanted = match direction {
            Direction::ToHost => s.placement.has(Placement::HOST) && produced_on_device,
            Direction::ToDevice => {
                s.placement.has(Placement::DEVICE)
                    && !s.placement.has(Placement::HOST)
                    && !produced_on_device
            }
        };
        if !wanted {
            continue;
        }
        if let (Some(host), Some(device)) = (tensor.offset, tensor.device_offset) {
            blocks.push(TransferBlock {
                host_offset: host,
                device_offset: device,
                size: tensor.space,
                task_index: s.task_index,
            });
        }
    }
    merge_transfers(blocks)
}

/// Generate programs for all cells: the main section, then one section per
/// task with its own entry point.
fn generate_cells(net: &mut Network) -> Result<(), CompileError> {
    for cid in 0..net.cells.len() {
        let steps = net.cells[cid].steps.clone();
        let kernels: Vec<_> = steps
            .iter()
            .map(|&s| net.steps[s].kernel.clone())
            .collect();
        let ntasks = net.cells[cid].tasks.len();
        let options = net.options.clone();

        let mut emit = Emitter::new(NUM_REGISTERS);
        let mut states = vec![TaskState::Pending; ntasks];
        let mut entries = vec![0usize; ntasks];

        // Main section.
        for (i, &step_id) in steps.iter().enumerate() {
            match net.steps[step_id].task_index {
                Some(task) => {
                    if states[task] == TaskState::Pending {
                        emit.emit(Instr::StartTask { index: task });
                        states[task] = TaskState::Active;
                    }
                }
                None => {
                    // Wait for active tasks producing inputs of this step.
                    for &input in &net.steps[step_id].inputs {
                        if let Some(p) = net.tensors[input].producer {
                            if let Some(task) = net.steps[p].task_index {
                                if states[task] == TaskState::Active {
                                    emit.emit(Instr::WaitTask { index: task });
                                    states[task] = TaskState::Completed;
                                }
                            }
                        }
                    }
                    if net.needs_synchronization(step_id) {
                        emit.emit(Instr::SyncMain);
                    }
                    let to_host = step_transfers(net, step_id, Direction::ToHost);
                    if !to_host.is_empty() {
                        emit.emit(Instr::Transfer {
                            direction: Direction::ToHost,
                            blocks: to_host,
                        });
                    }
                    let kernel = kernels[i].clone().ok_or_else(|| {
                        CompileError::UnsupportedOperation {
                            op: net.steps[step_id].name.clone(),
                            kind: net.steps[step_id].kind.clone(),
                        }
                    })?;
                    kernel.generate(step_id, net, &options, &mut emit)?;
                }
            }
        }
        for (task, state) in states.iter_mut().enumerate() {
            if *state == TaskState::Active {
                emit.emit(Instr::WaitTask { index: task });
                *state = TaskState::Completed;
            }
        }
        emit.emit(Instr::Ret);

        // Task sections.
        for task in 0..ntasks {
            entries[task] = emit.pc();
            for (i, &step_id) in steps.iter().enumerate() {
                if net.steps[step_id].task_index != Some(task) {
                    continue;
                }
                let to_device = step_transfers(net, step_id, Direction::ToDevice);
                if !to_device.is_empty() {
                    emit.emit(Instr::Transfer {
                        direction: Direction::ToDevice,
                        blocks: to_device,
                    });
                }
                let kernel = kernels[i].clone().ok_or_else(|| {
                    CompileError::UnsupportedOperation {
                        op: net.steps[step_id].name.clone(),
                        kind: net.steps[step_id].kind.clone(),
                    }
                })?;
                kernel.generate(step_id, net, &options, &mut emit)?;
            }
            emit.emit(Instr::Ret);
        }

        let register_usage = emit.register_usage();
        let program = emit.finish();
        let cell = &mut net.cells[cid];
        cell.program = program;
        cell.register_usage = register_usage;
        for task in 0..ntasks {
            cell.tasks[task].entry = entries[task];
            cell.tasks[task].state = states[task];
        }
        debug!(
            cell = %net.cells[cid].name,
            size = net.cells[cid].instance_size,
            registers = register_usage,
            "compiled cell"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::Instance;
    use crate::flow::DataType;
    use crate::kernels::standard_library;
    use crate::runtime::HostRuntime;

    fn host() -> Arc<dyn Runtime> {
        Arc::new(HostRuntime::new())
    }

    fn simple_flow() -> Flow {
        let mut flow = Flow::new();
        let f = flow.add_func("calc");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[3]));
        let y = flow.add_var("y", DataType::Float32, Shape::of(&[3]));
        let z = flow.add_var("z", DataType::Float32, Shape::of(&[3]));
        let t = flow.add_var("t", DataType::Float32, Shape::of(&[3]));
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[3]));
        flow.add_op(f, "add", "Add", &[x, y], &[t]);
        flow.add_op(f, "mul", "Mul", &[t, z], &[r]);
        flow
    }

    #[test]
    fn test_compile_and_run() {
        let library = standard_library();
        let net = compile(
            simple_flow(),
            &library,
            host(),
            CompileOptions::default(),
        )
        .unwrap();

        let cell = net.find_cell("calc").unwrap();
        let x = net.get_parameter("x").unwrap();
        let y = net.get_parameter("y").unwrap();
        let z = net.get_parameter("z").unwrap();
        let r = net.get_parameter("r").unwrap();

        let mut instance = Instance::new(&net, cell).unwrap();
        instance.set_f32(x, &[1.0, 2.0, 3.0]);
        instance.set_f32(y, &[4.0, 5.0, 6.0]);
        instance.set_f32(z, &[2.0, 2.0, 2.0]);
        instance.compute().unwrap();
        assert_eq!(instance.to_vec_f32(r), vec![10.0, 14.0, 18.0]);
    }

    #[test]
    fn test_fusion_produces_single_step() {
        let library = standard_library();
        let net = compile(
            simple_flow(),
            &library,
            host(),
            CompileOptions::default(),
        )
        .unwrap();
        let cell = net.find_cell("calc").unwrap();
        assert_eq!(net.cell(cell).steps.len(), 1);
        let step = net.step(net.cell(cell).steps[0]);
        assert_eq!(step.kind, "Calculate");
        assert_eq!(step.attr("expr"), Some("@0=Mul(Add(%0,%1),%2)"));
    }

    #[test]
    fn test_constant_folding_in_compile() {
        let mut flow = Flow::new();
        let f = flow.add_func("scale");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[4]));
        let c = flow.add_const_f32("c", Shape::scalar(), &[2.0]);
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[4]));
        flow.add_op(f, "div", "Div", &[x, c], &[r]);

        let library = standard_library();
        let net = compile(flow, &library, host(), CompileOptions::default()).unwrap();
        let cell = net.find_cell("scale").unwrap();
        let x = net.get_parameter("x").unwrap();
        let r = net.get_parameter("r").unwrap();
        let mut instance = Instance::new(&net, cell).unwrap();
        instance.set_f32(x, &[2.0, 4.0, 6.0, 8.0]);
        instance.compute().unwrap();
        assert_eq!(instance.to_vec_f32(r), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unsupported_operation_fails() {
        let mut flow = Flow::new();
        let f = flow.add_func("main");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[4]));
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[4]));
        flow.add_op(f, "mystery", "Mystery", &[x], &[r]);

        let library = standard_library();
        let result = compile(flow, &library, host(), CompileOptions::default());
        assert!(matches!(
            result,
            Err(CompileError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_in_place_sharing() {
        let mut flow = Flow::new();
        let f = flow.add_func("relu");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[8]));
        let t = flow.add_var("t", DataType::Float32, Shape::of(&[8]));
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[1]));
        flow.add_op(f, "neg", "Neg", &[x], &[t]);
        flow.add_op(f, "sum", "Sum", &[t], &[r]);
        // The shape change through the reduction keeps the two steps from
        // fusing, so the negation can run in place over its input.
        let library = standard_library();
        let net = compile(flow, &library, host(), CompileOptions::default()).unwrap();
        let cell = net.find_cell("relu").unwrap();
        let x = net.get_parameter("x").unwrap();
        let r = net.get_parameter("r").unwrap();
        let mut instance = Instance::new(&net, cell).unwrap();
        instance.set_f32(x, &[1.0; 8]);
        instance.compute().unwrap();
        assert_eq!(instance.get_elem::<f32>(r, 0), -8.0);
    }

    struct TestKernel {
        name: &'static str,
        location: Placement,
    }

    impl crate::kernel::Kernel for TestKernel {
        fn name(&self) -> &str {
            self.name
        }

        fn operation(&self) -> &str {
            "Blur"
        }

        fn location(&self) -> Placement {
            self.location
        }

        fn supports(&self, _step: StepId, _net: &Network) -> bool {
            true
        }

        fn generate(
            &self,
            _step: StepId,
            _net: &Network,
            _options: &CompileOptions,
            _emit: &mut Emitter,
        ) -> Result<(), CompileError> {
            Ok(())
        }
    }

    fn blur_flow() -> Flow {
        let mut flow = Flow::new();
        let f = flow.add_func("main");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[4]));
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[4]));
        flow.add_op(f, "blur", "Blur", &[x], &[r]);
        flow
    }

    #[test]
    fn test_selection_takes_first_supporting_kernel() {
        let mut library = Library::new();
        library.register(Arc::new(TestKernel {
            name: "BlurA",
            location: Placement::HOST,
        }));
        library.register(Arc::new(TestKernel {
            name: "BlurB",
            location: Placement::HOST,
        }));
        let net = compile(blur_flow(), &library, host(), CompileOptions::default()).unwrap();
        let cell = net.find_cell("main").unwrap();
        let step = net.step(net.cell(cell).steps[0]);
        assert_eq!(step.variant, "BlurA");
    }

    #[test]
    fn test_device_instance_layout() {
        let mut library = Library::new();
        library.register(Arc::new(TestKernel {
            name: "DevBlur",
            location: Placement::DEVICE,
        }));
        let net = compile(
            blur_flow(),
            &library,
            Arc::new(crate::runtime::StreamRuntime::new(1)),
            CompileOptions::default(),
        )
        .unwrap();
        let cell = net.find_cell("main").unwrap();
        assert!(net.cell(cell).device_instance_size > 0);
        let x = net.get_parameter("x").unwrap();
        let r = net.get_parameter("r").unwrap();
        assert!(net.tensor(x).device_offset.is_some());
        assert!(net.tensor(r).device_offset.is_some());
        assert_ne!(net.tensor(x).device_offset, net.tensor(r).device_offset);
    }

    #[test]
    fn test_profiling_layout() {
        let library = standard_library();
        let options = CompileOptions {
            profiling: true,
            ..Default::default()
        };
        let net = compile(simple_flow(), &library, host(), options).unwrap();
        let cell = net.find_cell("calc").unwrap();
        let profile = net.cell(cell).profile.unwrap();
        assert!(net.tensor(profile).offset.is_some());

        let mut instance = Instance::new(&net, cell).unwrap();
        instance.compute().unwrap();
        instance.compute().unwrap();
        assert_eq!(instance.get_elem::<i64>(profile, 0), 2);
    }

    #[test]
    fn test_cell_dump() {
        let library = standard_library();
        let net = compile(
            simple_flow(),
            &library,
            host(),
            CompileOptions {
                debug: true,
                ..Default::default()
            },
        )
        .unwrap();
        let cell = net.find_cell("calc").unwrap();
        let dump = net.cell_to_string(cell);
        assert!(dump.contains("calc"));
        assert!(dump.contains("Calculate"));
    }
}
