//! Computation data model
//!
//! Compiled networks are built from cells, steps, and tensors. A cell is the
//! compiled form of a flow function: an ordered list of steps (operations
//! bound to kernels) plus a fixed instance memory layout. Instances are the
//! per-invocation memory blocks holding parameter data; channels hold arrays
//! of connector elements shared between cells.

use crate::code::{execute, Program};
use crate::express::CostModel;
use crate::flow::{DataType, FuncId, Shape};
use crate::kernel::Kernel;
use crate::runtime::{DevicePtr, Runtime, RuntimeError, NULL_DEV};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

/// Tensor index in a network arena.
pub type TensorId = usize;
/// Step index in a network arena.
pub type StepId = usize;
/// Cell index in a network arena.
pub type CellId = usize;
/// Connector index in a network arena.
pub type ConnectorId = usize;

/// Element order for multi-dimensional tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Order {
    #[default]
    Any,
    RowMajor,
    ColumnMajor,
    Conflicting,
}

/// Combine two element order requirements.
pub fn combined_order(a: Order, b: Order) -> Order {
    match (a, b) {
        (Order::Any, other) => other,
        (other, Order::Any) => other,
        (x, y) if x == y => x,
        _ => Order::Conflicting,
    }
}

/// Placement of data or computation: a bitset over host and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Placement(u8);

impl Placement {
    pub const NOWHERE: Placement = Placement(0);
    pub const HOST: Placement = Placement(1);
    pub const DEVICE: Placement = Placement(2);
    pub const EVERYWHERE: Placement = Placement(3);

    pub fn has(self, other: Placement) -> bool {
        self.0 & other.0 != 0
    }

    pub fn add(&mut self, other: Placement) {
        self.0 |= other.0;
    }

    pub fn is_host_only(self) -> bool {
        self == Placement::HOST
    }
}

/// Compile-time task execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Active,
    Completed,
}

/// Task descriptor materialized in instance memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TaskSlot {
    pub id: i32,
    pub index: i32,
    pub state: u32,
}

/// Size of a task slot in instance memory, rounded for alignment.
pub const TASK_SLOT_SIZE: usize = 16;
pub const TASK_SLOT_ALIGN: usize = 8;

/// Cache line size used for connector alignment.
pub const CACHE_LINE_SIZE: usize = 64;

/// Compiler options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Cost model for kernel complexity comparison.
    pub cost_model: CostModel,
    /// Default element order for parameters without order requirements.
    pub parameter_element_order: Order,
    /// Include instruction listings in cell dumps.
    pub debug: bool,
    /// Add a profiling tensor with invocation counts and per-step timings
    /// to each cell.
    pub profiling: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            cost_model: CostModel::default(),
            parameter_element_order: Order::RowMajor,
            debug: false,
            profiling: false,
        }
    }
}

/// Tensor: a typed multi-dimensional parameter or constant in a network.
#[derive(Debug)]
pub struct Tensor {
    pub name: String,
    pub aliases: Vec<String>,
    pub dtype: DataType,
    pub shape: Shape,
    /// Shape with each dimension rounded up to its alignment requirement.
    pub aligned: Shape,
    /// Minimum element alignment for each dimension.
    pub alignment: Vec<usize>,
    /// Byte stride for each dimension.
    pub stride: Vec<usize>,
    /// Total byte size including padding.
    pub space: usize,
    /// Minimum byte alignment for the start of the tensor.
    pub byte_alignment: usize,
    pub required_order: Order,
    pub order: Order,
    /// Reference tensors hold a pointer to external storage.
    pub reference: bool,
    /// Offset in the host instance block; None if not materialized there.
    pub offset: Option<usize>,
    /// Offset in the device instance block.
    pub device_offset: Option<usize>,
    /// Constant data in padded layout; tensors with data need no instance
    /// slot.
    pub data: Option<Vec<u8>>,
    /// Device copy of constant data.
    pub device_data: DevicePtr,
    /// Tensor this tensor shares storage with.
    pub shared: Option<TensorId>,
    /// Tensor in another cell this tensor is linked to through a connector.
    pub link: Option<TensorId>,
    pub producer: Option<StepId>,
    pub consumers: Vec<StepId>,
    /// Owning cell; None for global constants.
    pub cell: Option<CellId>,
    pub input: bool,
    pub output: bool,
    pub placement: Placement,
}

impl Tensor {
    pub fn new(name: &str, dtype: DataType, shape: Shape) -> Tensor {
        let rank = shape.rank();
        Tensor {
            name: name.to_string(),
            aliases: Vec::new(),
            dtype,
            aligned: shape.clone(),
            shape,
            alignment: vec![1; rank],
            stride: vec![0; rank],
            space: 0,
            byte_alignment: dtype.size().max(1),
            required_order: Order::Any,
            order: Order::RowMajor,
            reference: false,
            offset: None,
            device_offset: None,
            data: None,
            device_data: NULL_DEV,
            shared: None,
            link: None,
            producer: None,
            consumers: Vec::new(),
            cell: None,
            input: false,
            output: false,
            placement: Placement::NOWHERE,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn elements(&self) -> usize {
        self.shape.elements().max(0) as usize
    }

    pub fn element_size(&self) -> usize {
        self.dtype.size()
    }

    pub fn is_constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar() || self.elements() == 1
    }

    /// Raise the minimum alignment requirement for a dimension.
    pub fn min_align(&mut self, d: usize, align: usize) {
        if self.alignment[d] < align {
            self.alignment[d] = align;
        }
    }

    /// Raise the minimum alignment requirement for the last dimension.
    pub fn min_align_last(&mut self, align: usize) {
        if let Some(last) = self.alignment.len().checked_sub(1) {
            self.min_align(last, align);
        }
    }

    /// Raise the minimum byte alignment for the tensor start.
    pub fn min_byte_align(&mut self, align: usize) {
        if self.byte_alignment < align {
            self.byte_alignment = align;
        }
    }

    /// Add an element order requirement.
    pub fn require_order(&mut self, order: Order) {
        self.required_order = combined_order(self.required_order, order);
    }

    pub fn supports_order(&self, order: Order) -> bool {
        combined_order(self.required_order, order) != Order::Conflicting
    }

    pub fn has_same_shape(&self, other: &Tensor) -> bool {
        self.shape == other.shape
    }

    /// Byte offset of a row in the tensor.
    pub fn row_offset(&self, r: usize) -> usize {
        if self.stride.is_empty() {
            0
        } else {
            r * self.stride[0]
        }
    }

    /// Byte offset of an element in a rank-2 tensor.
    pub fn elem_offset(&self, r: usize, c: usize) -> usize {
        r * self.stride[0] + c * self.stride[1]
    }

    /// True if the padded layout equals the dense layout.
    pub fn is_dense(&self) -> bool {
        self.aligned == self.shape
    }

    pub fn type_string(&self) -> String {
        let mut s = String::new();
        if self.reference {
            s.push('&');
        }
        s.push_str(self.dtype.name());
        if !self.shape.is_scalar() {
            s.push('[');
            s.push_str(&self.shape.to_string());
            s.push(']');
        }
        s
    }
}

/// Step: an operation bound to a kernel inside a cell.
pub struct Step {
    pub name: String,
    pub kind: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attrs: BTreeMap<String, String>,
    pub cell: CellId,
    pub kernel: Option<Arc<dyn Kernel>>,
    pub variant: String,
    /// Index into the cell task table; None runs in the main task.
    pub task_index: Option<usize>,
    pub placement: Placement,
}

impl Step {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    pub fn kernel_name(&self) -> &str {
        self.kernel.as_ref().map(|k| k.name()).unwrap_or("?")
    }
}

/// Task entry in a cell: compile-time state machine plus generated entry
/// point and instance offset for the runtime task slot.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Task id from the flow.
    pub task: i32,
    pub state: TaskState,
    /// Entry point into the cell program; set during code generation.
    pub entry: usize,
    /// Offset of the task slot in instance memory.
    pub offset: usize,
    pub placement: Placement,
}

/// Cell: compiled flow function with memory layout and generated code.
pub struct Cell {
    pub name: String,
    pub func: FuncId,
    pub steps: Vec<StepId>,
    pub tasks: Vec<TaskInfo>,
    pub instance_size: usize,
    pub instance_alignment: usize,
    pub device_instance_size: usize,
    pub device_instance_alignment: usize,
    /// First offset after the runtime header and task slots; clearing an
    /// instance only zeroes from here.
    pub data_start: usize,
    pub register_usage: usize,
    pub program: Program,
    pub profile: Option<TensorId>,
}

impl Cell {
    /// Index in the task table of a flow task id.
    pub fn task_index(&self, task: i32) -> Option<usize> {
        self.tasks.iter().position(|t| t.task == task)
    }
}

/// Connector: element prototype for channels linking cells.
pub struct Connector {
    pub name: String,
    /// Prototype tensor describing the element type, shape, and alignment.
    pub prototype: TensorId,
}

/// Compiled network of cells sharing tensors and connectors.
pub struct Network {
    pub tensors: Vec<Tensor>,
    pub steps: Vec<Step>,
    pub cells: Vec<Cell>,
    pub connectors: Vec<Connector>,
    pub names: HashMap<String, TensorId>,
    pub runtime: Arc<dyn Runtime>,
    pub options: CompileOptions,
}

impl Network {
    pub fn new(runtime: Arc<dyn Runtime>, options: CompileOptions) -> Network {
        Network {
            tensors: Vec::new(),
            steps: Vec::new(),
            cells: Vec::new(),
            connectors: Vec::new(),
            names: HashMap::new(),
            runtime,
            options,
        }
    }

    pub fn tensor(&self, id: TensorId) -> &Tensor {
        &self.tensors[id]
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> &mut Tensor {
        &mut self.tensors[id]
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id]
    }

    pub fn step_mut(&mut self, id: StepId) -> &mut Step {
        &mut self.steps[id]
    }

    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id]
    }

    /// Look up a cell by name.
    pub fn find_cell(&self, name: &str) -> Option<CellId> {
        self.cells.iter().position(|c| c.name == name)
    }

    /// Look up a parameter or constant tensor by name or alias.
    pub fn get_parameter(&self, name: &str) -> Option<TensorId> {
        if let Some(&id) = self.names.get(name) {
            return Some(id);
        }
        self.tensors
            .iter()
            .position(|t| t.aliases.iter().any(|a| a == name))
    }

    /// Look up a connector by name.
    pub fn find_connector(&self, name: &str) -> Option<ConnectorId> {
        self.connectors.iter().position(|c| c.name == name)
    }

    /// Resolve a shared-storage chain to the tensor owning the storage.
    pub fn storage_root(&self, id: TensorId) -> TensorId {
        let mut t = id;
        while let Some(shared) = self.tensors[t].shared {
            t = shared;
        }
        t
    }

    /// Propagate alignment requirements between two tensors with compatible
    /// shapes so they can share or link storage.
    pub fn compatible_align(&mut self, a: TensorId, b: TensorId) -> bool {
        if a == b {
            return true;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.tensors.split_at_mut(hi);
        let (ta, tb) = if a < b {
            (&mut head[lo], &mut tail[0])
        } else {
            (&mut tail[0], &mut head[lo])
        };
        // Align dimensions from the end.
        let mut da = ta.rank() as i64 - 1;
        let mut db = tb.rank() as i64 - 1;
        while da >= 0 && db >= 0 {
            let align = ta.alignment[da as usize].max(tb.alignment[db as usize]);
            ta.alignment[da as usize] = align;
            tb.alignment[db as usize] = align;
            da -= 1;
            db -= 1;
        }
        let byte_align = ta.byte_alignment.max(tb.byte_alignment);
        ta.byte_alignment = byte_align;
        tb.byte_alignment = byte_align;
        // Combine order requirements.
        let order = combined_order(ta.required_order, tb.required_order);
        ta.required_order = order;
        tb.required_order = order;
        order != Order::Conflicting
    }

    /// Let a step compute an output in place over one of its inputs. The
    /// storage can only be reused if the input has no other consumers, the
    /// reference flags match, the output does not already share storage,
    /// and no other output of the step already claimed the same storage.
    pub fn allow_in_place(&mut self, step: StepId, input: usize, output: usize) -> bool {
        let in_id = self.steps[step].inputs[input];
        let out_id = self.steps[step].outputs[output];
        let root = self.storage_root(in_id);
        {
            let t = &self.tensors[root];
            if t.consumers.len() != 1 {
                return false;
            }
            if t.is_constant() {
                return false;
            }
            if t.output {
                return false;
            }
            if t.reference != self.tensors[out_id].reference {
                return false;
            }
        }
        if self.tensors[out_id].shared.is_some() {
            return false;
        }
        for &o in &self.steps[step].outputs {
            if o != out_id && self.storage_root(o) == root {
                return false;
            }
        }
        if !self.compatible_align(root, out_id) {
            return false;
        }
        self.tensors[out_id].shared = Some(root);
        true
    }

    /// Check if a step running on the host in the main task consumes data
    /// produced on the device in the main task. Such steps need a
    /// synchronization point before running.
    pub fn needs_synchronization(&self, step: StepId) -> bool {
        let s = &self.steps[step];
        if !s.placement.is_host_only() {
            return false;
        }
        if s.task_index.is_some() {
            return false;
        }
        for &input in &s.inputs {
            let producer = match self.tensors[input].producer {
                Some(p) => p,
                None => continue,
            };
            if self.steps[producer].placement.is_host_only() {
                continue;
            }
            if self.steps[producer].task_index.is_some() {
                continue;
            }
            return true;
        }
        false
    }

    /// Render a cell's instance layout and step listing.
    pub fn cell_to_string(&self, id: CellId) -> String {
        let cell = &self.cells[id];
        let mut str = String::new();
        let _ = writeln!(
            str,
            "cell {} // size {} align {}",
            cell.name, cell.instance_size, cell.instance_alignment
        );
        for (t, tensor) in self.tensors.iter().enumerate() {
            if tensor.cell != Some(id) {
                continue;
            }
            if let Some(shared) = tensor.shared {
                let _ = writeln!(
                    str,
                    "  {} {} union {}",
                    tensor.type_string(),
                    tensor.name,
                    self.tensors[shared].name
                );
            } else if let Some(offset) = tensor.offset {
                let _ = writeln!(
                    str,
                    "  {} {} @ {} // space {}",
                    tensor.type_string(),
                    tensor.name,
                    offset,
                    tensor.space
                );
            } else if tensor.is_constant() {
                let _ = writeln!(str, "  {} {} const", tensor.type_string(), tensor.name);
            }
            let _ = t;
        }
        for &s in &cell.steps {
            let step = &self.steps[s];
            let inputs: Vec<&str> = step
                .inputs
                .iter()
                .map(|&t| self.tensors[t].name.as_str())
                .collect();
            let outputs: Vec<&str> = step
                .outputs
                .iter()
                .map(|&t| self.tensors[t].name.as_str())
                .collect();
            let task = match step.task_index {
                Some(i) => format!(" task {}", cell.tasks[i].task),
                None => String::new(),
            };
            let _ = writeln!(
                str,
                "  {} = {} [{}]({}){}",
                outputs.join(", "),
                step.kind,
                step.kernel_name(),
                inputs.join(", "),
                task
            );
        }
        if self.options.debug {
            str.push_str(&cell.program.listing());
        }
        str
    }
}

/// Channel: a runtime-resizable array of connector elements.
pub struct Channel {
    runtime: Arc<dyn Runtime>,
    data: *mut u8,
    /// Current number of elements.
    size: usize,
    /// Allocated capacity in elements.
    capacity: usize,
    /// Byte size of one element including padding.
    elem_space: usize,
    alignment: usize,
}

unsafe impl Send for Channel {}

impl Channel {
    pub fn new(net: &Network, connector: ConnectorId) -> Channel {
        let prototype = &net.tensors[net.connectors[connector].prototype];
        Channel {
            runtime: net.runtime.clone(),
            data: std::ptr::null_mut(),
            size: 0,
            capacity: 0,
            elem_space: prototype.space,
            alignment: prototype.byte_alignment.max(CACHE_LINE_SIZE),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Pointer to an element in the channel.
    pub fn at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.size);
        unsafe { self.data.add(index * self.elem_space) }
    }

    /// Typed view of an element.
    pub fn get<T: Copy>(&self, index: usize) -> &[T] {
        let n = self.elem_space / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts(self.at(index) as *const T, n) }
    }

    pub fn get_mut<T: Copy>(&mut self, index: usize) -> &mut [T] {
        let n = self.elem_space / std::mem::size_of::<T>();
        unsafe { std::slice::from_raw_parts_mut(self.at(index) as *mut T, n) }
    }

    /// Reserve capacity for at least `n` elements.
    pub fn reserve(&mut self, n: usize) -> Result<(), RuntimeError> {
        if n <= self.capacity {
            return Ok(());
        }
        let bytes = n * self.elem_space;
        let data = self.runtime.allocate_channel(bytes, self.alignment)?;
        if !self.data.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(self.data, data, self.size * self.elem_space);
            }
            self.runtime
                .free_channel(self.data, self.capacity * self.elem_space, self.alignment);
        }
        self.data = data;
        self.capacity = n;
        Ok(())
    }

    /// Resize the channel, zeroing any new elements. Capacity grows by
    /// doubling.
    pub fn resize(&mut self, n: usize) -> Result<(), RuntimeError> {
        if n > self.capacity {
            let cap = n.max(self.capacity * 2).max(8);
            self.reserve(cap)?;
        }
        if n > self.size {
            unsafe {
                std::ptr::write_bytes(
                    self.data.add(self.size * self.elem_space),
                    0,
                    (n - self.size) * self.elem_space,
                );
            }
        }
        self.size = n;
        Ok(())
    }

    /// Append one zeroed element and return its index.
    pub fn push(&mut self) -> Result<usize, RuntimeError> {
        self.resize(self.size + 1)?;
        Ok(self.size - 1)
    }

    /// Remove the last element.
    pub fn pop(&mut self) {
        if self.size > 0 {
            self.size -= 1;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.data.is_null() {
            self.runtime
                .free_channel(self.data, self.capacity * self.elem_space, self.alignment);
        }
    }
}

/// Instance: per-invocation data block for a cell.
pub struct Instance<'a> {
    net: &'a Network,
    cell: CellId,
    data: *mut u8,
    device: DevicePtr,
}

unsafe impl<'a> Send for Instance<'a> {}

impl<'a> Instance<'a> {
    pub fn new(net: &'a Network, cell: CellId) -> Result<Instance<'a>, RuntimeError> {
        let c = &net.cells[cell];
        let data = net
            .runtime
            .allocate_instance(c.instance_size.max(1), c.instance_alignment.max(1))?;
        let device = if c.device_instance_size > 0 && net.runtime.supports_device() {
            net.runtime.allocate_device(c.device_instance_size)?
        } else {
            NULL_DEV
        };
        let mut instance = Instance {
            net,
            cell,
            data,
            device,
        };
        instance.clear();
        Ok(instance)
    }

    pub fn cell(&self) -> &Cell {
        &self.net.cells[self.cell]
    }

    pub fn data(&self) -> *mut u8 {
        self.data
    }

    pub fn device(&self) -> DevicePtr {
        self.device
    }

    /// Reset all parameter data and task slots.
    pub fn clear(&mut self) {
        let cell = &self.net.cells[self.cell];
        unsafe {
            std::ptr::write_bytes(self.data, 0, cell.instance_size);
        }
        for (index, task) in cell.tasks.iter().enumerate() {
            let slot = TaskSlot {
                id: task.task,
                index: index as i32,
                state: 0,
            };
            unsafe {
                std::ptr::write(self.data.add(task.offset) as *mut TaskSlot, slot);
            }
        }
    }

    /// Run the cell computation on the instance data.
    pub fn compute(&mut self) -> Result<(), RuntimeError> {
        execute(self.net, self.cell, self.data, self.device)
    }

    fn slice_bounds<T>(&self, param: TensorId) -> (usize, usize) {
        let tensor = &self.net.tensors[param];
        let offset = tensor.offset.unwrap_or(0);
        (offset, tensor.space / std::mem::size_of::<T>())
    }

    /// Typed view of a parameter in the instance.
    pub fn get<T: Copy>(&self, param: TensorId) -> &[T] {
        let (offset, n) = self.slice_bounds::<T>(param);
        unsafe { std::slice::from_raw_parts(self.data.add(offset) as *const T, n) }
    }

    /// Mutable typed view of a parameter in the instance.
    pub fn get_mut<T: Copy>(&mut self, param: TensorId) -> &mut [T] {
        let (offset, n) = self.slice_bounds::<T>(param);
        unsafe { std::slice::from_raw_parts_mut(self.data.add(offset) as *mut T, n) }
    }

    /// Read one element of a rank-0 or rank-1 parameter.
    pub fn get_elem<T: Copy>(&self, param: TensorId, index: usize) -> T {
        self.get::<T>(param)[index]
    }

    /// Typed view of one row of a rank-2 parameter, without row padding.
    pub fn get_row<T: Copy>(&self, param: TensorId, row: usize) -> &[T] {
        let tensor = &self.net.tensors[param];
        let offset = tensor.offset.unwrap_or(0) + tensor.row_offset(row);
        let cols = tensor.shape.dim(tensor.rank().saturating_sub(1)).max(0) as usize;
        unsafe { std::slice::from_raw_parts(self.data.add(offset) as *const T, cols) }
    }

    /// Set all elements of an f32 parameter from a dense slice, honoring
    /// row padding.
    pub fn set_f32(&mut self, param: TensorId, values: &[f32]) {
        let tensor = &self.net.tensors[param];
        debug_assert_eq!(tensor.dtype, DataType::Float32);
        if tensor.rank() <= 1 || tensor.is_dense() {
            let dst = self.get_mut::<f32>(param);
            dst[..values.len()].copy_from_slice(values);
        } else {
            let rows = tensor.shape.dim(0) as usize;
            let cols = tensor.shape.dim(1) as usize;
            let stride = tensor.stride[0] / 4;
            let dst = self.get_mut::<f32>(param);
            for r in 0..rows {
                dst[r * stride..r * stride + cols].copy_from_slice(&values[r * cols..(r + 1) * cols]);
            }
        }
    }

    /// Dense f32 copy of a parameter, dropping row padding.
    pub fn to_vec_f32(&self, param: TensorId) -> Vec<f32> {
        let tensor = &self.net.tensors[param];
        if tensor.rank() <= 1 || tensor.is_dense() {
            return self.get::<f32>(param)[..tensor.elements()].to_vec();
        }
        let rows = tensor.shape.dim(0) as usize;
        let cols = tensor.shape.dim(1) as usize;
        let stride = tensor.stride[0] / 4;
        let src = self.get::<f32>(param);
        let mut out = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            out.extend_from_slice(&src[r * stride..r * stride + cols]);
        }
        out
    }

    /// Bind a reference parameter to a channel element.
    pub fn set_channel(&mut self, param: TensorId, channel: &Channel, index: usize) {
        let tensor = &self.net.tensors[param];
        debug_assert!(tensor.reference);
        let offset = tensor.offset.unwrap_or(0);
        unsafe {
            std::ptr::write(self.data.add(offset) as *mut *mut u8, channel.at(index));
        }
    }

    /// Render one parameter value.
    pub fn parameter_to_string(&self, param: TensorId) -> String {
        let tensor = &self.net.tensors[param];
        if tensor.reference || tensor.offset.is_none() {
            return format!("{} = <ref>", tensor.name);
        }
        if tensor.dtype != DataType::Float32 {
            return format!("{} = <{}>", tensor.name, tensor.dtype.name());
        }
        format!("{} = {:?}", tensor.name, self.to_vec_f32(param))
    }

    /// Render all parameters of the instance.
    pub fn to_string(&self) -> String {
        let mut str = String::new();
        for (t, tensor) in self.net.tensors.iter().enumerate() {
            if tensor.cell != Some(self.cell) || tensor.offset.is_none() {
                continue;
            }
            str.push_str(&self.parameter_to_string(t));
            str.push('\n');
        }
        str
    }
}

impl<'a> Drop for Instance<'a> {
    fn drop(&mut self) {
        let cell = &self.net.cells[self.cell];
        self.net.runtime.free_instance(
            self.data,
            cell.instance_size.max(1),
            cell.instance_alignment.max(1),
        );
        if self.device != NULL_DEV {
            self.net.runtime.free_device(self.device);
        }
    }
}
