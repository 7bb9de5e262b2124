//! Flow graph IR
//!
//! A flow is the dataflow graph handed to the compiler: typed variables,
//! operations with string attributes, functions grouping operations into
//! compilation units, and connectors linking variables across cells.
//! Flows are produced by an external authoring process and consumed here;
//! they can be saved to and loaded from JSON files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Variable index in a flow.
pub type VarId = usize;
/// Operation index in a flow.
pub type OpId = usize;
/// Function index in a flow.
pub type FuncId = usize;

/// Flow graph errors.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("failed to read flow file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse flow file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cyclic dependency involving operation {0}")]
    Cycle(String),
}

/// Element data types for variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    #[default]
    Invalid,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Invalid => 0,
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float64 | DataType::Int64 => 8,
            DataType::Int8 | DataType::Uint8 | DataType::Bool => 1,
            DataType::Int16 | DataType::Uint16 => 2,
        }
    }

    /// Type name used in dumps and flow files.
    pub fn name(self) -> &'static str {
        match self {
            DataType::Invalid => "invalid",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::Uint8 => "uint8",
            DataType::Uint16 => "uint16",
            DataType::Bool => "bool",
        }
    }
}

/// Tensor shape. A dimension of -1 is undefined (used for connector rows).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Shape(pub Vec<i64>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn of(dims: &[i64]) -> Self {
        Shape(dims.to_vec())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dim(&self, d: usize) -> i64 {
        self.0[d]
    }

    pub fn set(&mut self, d: usize, size: i64) {
        self.0[d] = size;
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Total number of elements, or -1 if some dimension is undefined.
    pub fn elements(&self) -> i64 {
        let mut n: i64 = 1;
        for &d in &self.0 {
            if d == -1 {
                return -1;
            }
            n *= d;
        }
        n
    }

    /// Broadcast compatibility: trailing dimensions must match unless one
    /// of them is undefined or one.
    pub fn compatible(&self, other: &Shape) -> bool {
        let mut d1 = self.rank() as i64 - 1;
        let mut d2 = other.rank() as i64 - 1;
        while d1 >= 0 && d2 >= 0 {
            let s1 = self.dim(d1 as usize);
            let s2 = other.dim(d2 as usize);
            d1 -= 1;
            d2 -= 1;
            if s1 == -1 || s1 == 1 {
                continue;
            }
            if s2 == -1 || s2 == 1 {
                continue;
            }
            if s1 != s2 {
                return false;
            }
        }
        true
    }

    pub fn to_string(&self) -> String {
        self.0
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join("x")
    }
}

/// Flow variable: an input, output, constant, or intermediate value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub dtype: DataType,
    pub shape: Shape,
    /// Reference variables hold a pointer to external storage (e.g. a
    /// channel element) instead of inline data.
    #[serde(default)]
    pub reference: bool,
    /// Constant data in little-endian element order. None for parameters.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    /// Function input flag.
    #[serde(default)]
    pub input: bool,
    /// Function output flag.
    #[serde(default)]
    pub output: bool,

    #[serde(skip)]
    pub producer: Option<OpId>,
    #[serde(skip)]
    pub consumers: Vec<OpId>,
    #[serde(skip)]
    pub dead: bool,
}

impl Variable {
    pub fn constant(&self) -> bool {
        self.data.is_some()
    }

    pub fn elements(&self) -> i64 {
        self.shape.elements()
    }

    /// Constant data reinterpreted as f32 elements.
    pub fn data_f32(&self) -> Option<Vec<f32>> {
        let bytes = self.data.as_ref()?;
        if self.dtype != DataType::Float32 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Flow operation: a typed node with input and output variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    /// Operation type, e.g. "Add" or "Calculate".
    pub kind: String,
    pub inputs: Vec<VarId>,
    pub outputs: Vec<VarId>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub func: Option<FuncId>,
    /// Task id for parallel execution; 0 runs in the main task.
    #[serde(default)]
    pub task: i32,

    #[serde(skip)]
    pub dead: bool,
}

impl Operation {
    pub fn indegree(&self) -> usize {
        self.inputs.len()
    }

    pub fn outdegree(&self) -> usize {
        self.outputs.len()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(|s| s.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        self.attrs.insert(name.to_string(), value.into());
    }

    pub fn is_input(&self, var: VarId) -> bool {
        self.inputs.contains(&var)
    }

    pub fn is_output(&self, var: VarId) -> bool {
        self.outputs.contains(&var)
    }
}

/// Flow function: an ordered group of operations compiled into one cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub ops: Vec<OpId>,
}

/// Flow connector: links reference variables across cells so they can share
/// channel storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConnector {
    pub name: String,
    pub links: Vec<VarId>,
}

/// Component for rewriting a flow before kernel selection. Transformers are
/// run repeatedly until none of them reports a change.
pub trait Transformer: Send + Sync {
    /// Apply the transformation. Return true if the flow was changed.
    fn transform(&self, flow: &mut Flow) -> bool;
}

/// Dataflow graph to be compiled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    pub vars: Vec<Variable>,
    pub ops: Vec<Operation>,
    pub funcs: Vec<Function>,
    pub cnxs: Vec<FlowConnector>,
}

impl Flow {
    pub fn new() -> Self {
        Flow::default()
    }

    /// Load a flow from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Flow, FlowError> {
        let content = std::fs::read_to_string(path)?;
        let mut flow: Flow = serde_json::from_str(&content)?;
        flow.relink();
        Ok(flow)
    }

    /// Save the flow to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), FlowError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Add a parameter variable.
    pub fn add_var(&mut self, name: &str, dtype: DataType, shape: Shape) -> VarId {
        self.vars.push(Variable {
            name: name.to_string(),
            aliases: Vec::new(),
            dtype,
            shape,
            reference: false,
            data: None,
            input: false,
            output: false,
            producer: None,
            consumers: Vec::new(),
            dead: false,
        });
        self.vars.len() - 1
    }

    /// Add a constant variable with f32 data.
    pub fn add_const_f32(&mut self, name: &str, shape: Shape, values: &[f32]) -> VarId {
        let id = self.add_var(name, DataType::Float32, shape);
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.vars[id].data = Some(bytes);
        id
    }

    /// Add an operation to a function, wiring producer/consumer edges.
    pub fn add_op(
        &mut self,
        func: FuncId,
        name: &str,
        kind: &str,
        inputs: &[VarId],
        outputs: &[VarId],
    ) -> OpId {
        let id = self.ops.len();
        for &input in inputs {
            self.vars[input].consumers.push(id);
        }
        for &output in outputs {
            debug_assert!(self.vars[output].producer.is_none());
            self.vars[output].producer = Some(id);
        }
        self.ops.push(Operation {
            name: name.to_string(),
            kind: kind.to_string(),
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            attrs: BTreeMap::new(),
            func: Some(func),
            task: 0,
            dead: false,
        });
        self.funcs[func].ops.push(id);
        id
    }

    /// Add a function.
    pub fn add_func(&mut self, name: &str) -> FuncId {
        self.funcs.push(Function {
            name: name.to_string(),
            ops: Vec::new(),
        });
        self.funcs.len() - 1
    }

    /// Add a connector over the given reference variables.
    pub fn add_connector(&mut self, name: &str, links: &[VarId]) -> usize {
        self.cnxs.push(FlowConnector {
            name: name.to_string(),
            links: links.to_vec(),
        });
        self.cnxs.len() - 1
    }

    /// Look up a variable by name.
    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| !v.dead && (v.name == name || v.aliases.iter().any(|a| a == name)))
    }

    /// Look up an operation by name.
    pub fn find_op(&self, name: &str) -> Option<OpId> {
        self.ops.iter().position(|o| !o.dead && o.name == name)
    }

    /// Live operation ids.
    pub fn live_ops(&self) -> Vec<OpId> {
        (0..self.ops.len()).filter(|&o| !self.ops[o].dead).collect()
    }

    /// Remove an input edge from an operation.
    pub fn remove_input(&mut self, op: OpId, var: VarId) {
        if let Some(pos) = self.ops[op].inputs.iter().position(|&v| v == var) {
            self.ops[op].inputs.remove(pos);
        }
        if let Some(pos) = self.vars[var].consumers.iter().position(|&o| o == op) {
            self.vars[var].consumers.remove(pos);
        }
    }

    /// Replace an operation input, rewiring consumer edges.
    pub fn replace_input(&mut self, op: OpId, pos: usize, var: VarId) {
        let old = self.ops[op].inputs[pos];
        if let Some(p) = self.vars[old].consumers.iter().position(|&o| o == op) {
            self.vars[old].consumers.remove(p);
        }
        self.ops[op].inputs[pos] = var;
        self.vars[var].consumers.push(op);
    }

    /// Remove an output edge from an operation.
    pub fn remove_output(&mut self, op: OpId, var: VarId) {
        if let Some(pos) = self.ops[op].outputs.iter().position(|&v| v == var) {
            self.ops[op].outputs.remove(pos);
        }
        if self.vars[var].producer == Some(op) {
            self.vars[var].producer = None;
        }
    }

    /// Mark an operation dead, detaching all edges.
    pub fn delete_op(&mut self, op: OpId) {
        let inputs = self.ops[op].inputs.clone();
        let outputs = self.ops[op].outputs.clone();
        for var in inputs {
            self.remove_input(op, var);
        }
        for var in outputs {
            self.remove_output(op, var);
        }
        if let Some(func) = self.ops[op].func {
            self.funcs[func].ops.retain(|&o| o != op);
        }
        self.ops[op].dead = true;
    }

    /// Mark a variable dead. The variable must have no remaining edges.
    pub fn delete_var(&mut self, var: VarId) {
        debug_assert!(self.vars[var].producer.is_none());
        debug_assert!(self.vars[var].consumers.is_empty());
        self.vars[var].dead = true;
    }

    /// Check if a variable transitively depends on an operation.
    pub fn depends_on(&self, var: VarId, op: OpId) -> bool {
        let mut stack = vec![var];
        let mut visited = vec![false; self.vars.len()];
        while let Some(v) = stack.pop() {
            if visited[v] {
                continue;
            }
            visited[v] = true;
            if let Some(producer) = self.vars[v].producer {
                if producer == op {
                    return true;
                }
                for &input in &self.ops[producer].inputs {
                    stack.push(input);
                }
            }
        }
        false
    }

    /// Replace an operation's type in place, preserving edges.
    pub fn replace_kind(&mut self, op: OpId, kind: &str) {
        self.ops[op].kind = kind.to_string();
    }

    /// Fuse two operations into one combined operation. Variables that are
    /// produced by `first`, consumed only by `second`, and not declared
    /// outputs become internal and are removed from the graph. The fused
    /// operation keeps `first`'s inputs followed by `second`'s remaining
    /// inputs, and `first`'s surviving outputs followed by `second`'s.
    pub fn fuse(&mut self, first: OpId, second: OpId, kind: &str) -> OpId {
        let func = self.ops[first].func;
        let name = self.ops[second].name.clone();
        let task = self.ops[first].task;

        // Find internal variables: outputs of first consumed only by second.
        let mut internal = Vec::new();
        for &out in &self.ops[first].outputs {
            let var = &self.vars[out];
            let only_second = var.consumers.iter().all(|&c| c == second);
            if only_second && !var.consumers.is_empty() && !var.output {
                internal.push(out);
            }
        }

        // Combined input list: first's inputs, then second's inputs that are
        // neither inputs nor outputs of first. Outputs of first consumed by
        // second stay outputs of the fused operation.
        let mut inputs = self.ops[first].inputs.clone();
        for &input in &self.ops[second].inputs.clone() {
            if !inputs.contains(&input)
                && !internal.contains(&input)
                && !self.ops[first].outputs.contains(&input)
            {
                inputs.push(input);
            }
        }

        // Combined output list: first's surviving outputs, then second's.
        let mut outputs: Vec<VarId> = self.ops[first]
            .outputs
            .iter()
            .copied()
            .filter(|v| !internal.contains(v))
            .collect();
        outputs.extend(self.ops[second].outputs.iter().copied());

        // Detach the originals and the internal variables.
        self.delete_op(first);
        self.delete_op(second);
        for var in internal {
            self.delete_var(var);
        }

        // Create the combined operation.
        let fused = self.add_op(func.unwrap_or(0), &name, kind, &inputs, &outputs);
        self.ops[fused].task = task;
        fused
    }

    /// Rebuild producer/consumer edges from the operation lists. Used after
    /// loading a flow from a file.
    pub fn relink(&mut self) {
        for var in &mut self.vars {
            var.producer = None;
            var.consumers.clear();
        }
        for id in 0..self.ops.len() {
            if self.ops[id].dead {
                continue;
            }
            for i in 0..self.ops[id].inputs.len() {
                let v = self.ops[id].inputs[i];
                self.vars[v].consumers.push(id);
            }
            for i in 0..self.ops[id].outputs.len() {
                let v = self.ops[id].outputs[i];
                self.vars[v].producer = Some(id);
            }
        }
    }

    /// Sort each function's operations into topological order of
    /// computation. Fails on cyclic dependencies.
    pub fn sort(&mut self) -> Result<(), FlowError> {
        for f in 0..self.funcs.len() {
            let ops: Vec<OpId> = self.funcs[f]
                .ops
                .iter()
                .copied()
                .filter(|&o| !self.ops[o].dead)
                .collect();
            let mut missing: BTreeMap<OpId, usize> = BTreeMap::new();
            for &op in &ops {
                let mut count = 0;
                for &input in &self.ops[op].inputs {
                    if let Some(producer) = self.vars[input].producer {
                        if producer != op && ops.contains(&producer) {
                            count += 1;
                        }
                    }
                }
                missing.insert(op, count);
            }
            let mut ready: Vec<OpId> = ops
                .iter()
                .copied()
                .filter(|o| missing[o] == 0)
                .collect();
            let mut order = Vec::with_capacity(ops.len());
            while let Some(op) = ready.pop() {
                order.push(op);
                for &output in &self.ops[op].outputs.clone() {
                    for &consumer in &self.vars[output].consumers.clone() {
                        if consumer == op || !ops.contains(&consumer) {
                            continue;
                        }
                        let m = missing.get_mut(&consumer).unwrap();
                        *m -= 1;
                        if *m == 0 {
                            ready.push(consumer);
                        }
                    }
                }
            }
            if order.len() != ops.len() {
                let stuck = ops
                    .iter()
                    .find(|o| !order.contains(o))
                    .map(|&o| self.ops[o].name.clone())
                    .unwrap_or_default();
                return Err(FlowError::Cycle(stuck));
            }
            self.funcs[f].ops = order;
        }
        Ok(())
    }

    /// Infer which variables are function inputs and outputs. A variable
    /// with no producer and no constant data is an input; a variable with no
    /// consumers is an output.
    pub fn infer_inputs_and_outputs(&mut self) {
        for v in 0..self.vars.len() {
            let var = &self.vars[v];
            if var.dead {
                continue;
            }
            if var.producer.is_none() && !var.constant() {
                self.vars[v].input = true;
            }
            if self.vars[v].consumers.is_empty() && self.vars[v].producer.is_some() {
                self.vars[v].output = true;
            }
        }
    }

    /// Run the transformer set to a fixed point, then sort and infer
    /// inputs/outputs.
    pub fn analyze(&mut self, transformers: &[Box<dyn Transformer>]) -> Result<(), FlowError> {
        self.infer_inputs_and_outputs();
        let mut again = true;
        while again {
            again = false;
            for t in transformers {
                if t.transform(self) {
                    again = true;
                }
            }
        }
        self.sort()
    }

    /// Render the flow in text format for debugging.
    pub fn to_string(&self) -> String {
        let mut str = String::new();
        for var in self.vars.iter().filter(|v| !v.dead) {
            str.push_str(&format!(
                "var {}: {}[{}]{}\n",
                var.name,
                var.dtype.name(),
                var.shape.to_string(),
                if var.constant() { " const" } else { "" }
            ));
        }
        for op in self.ops.iter().filter(|o| !o.dead) {
            let inputs: Vec<&str> = op.inputs.iter().map(|&v| self.vars[v].name.as_str()).collect();
            let outputs: Vec<&str> = op.outputs.iter().map(|&v| self.vars[v].name.as_str()).collect();
            str.push_str(&format!(
                "{} = {}({})  // {}\n",
                outputs.join(", "),
                op.kind,
                inputs.join(", "),
                op.name
            ));
        }
        str
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_flow() -> (Flow, VarId, VarId, VarId) {
        let mut flow = Flow::new();
        let f = flow.add_func("main");
        let x = flow.add_var("x", DataType::Float32, Shape::of(&[3]));
        let y = flow.add_var("y", DataType::Float32, Shape::of(&[3]));
        let t = flow.add_var("t", DataType::Float32, Shape::of(&[3]));
        let r = flow.add_var("r", DataType::Float32, Shape::of(&[3]));
        flow.add_op(f, "add", "Add", &[x, y], &[t]);
        flow.add_op(f, "mul", "Mul", &[t, x], &[r]);
        (flow, x, t, r)
    }

    #[test]
    fn test_edges() {
        let (flow, x, t, r) = simple_flow();
        assert_eq!(flow.vars[x].consumers.len(), 2);
        assert_eq!(flow.vars[t].producer, Some(0));
        assert_eq!(flow.vars[r].producer, Some(1));
        assert!(flow.depends_on(r, 0));
        assert!(!flow.depends_on(x, 0));
    }

    #[test]
    fn test_sort_detects_order() {
        let (mut flow, ..) = simple_flow();
        // Reverse the declared order; sort must restore dependency order.
        flow.funcs[0].ops.reverse();
        flow.sort().unwrap();
        assert_eq!(flow.funcs[0].ops, vec![0, 1]);
    }

    #[test]
    fn test_fuse() {
        let (mut flow, x, t, r) = simple_flow();
        let fused = flow.fuse(0, 1, "Calculate");
        let op = &flow.ops[fused];
        assert_eq!(op.kind, "Calculate");
        // t is internal, x deduplicated: inputs are x, y.
        assert_eq!(op.inputs.len(), 2);
        assert!(op.inputs.contains(&x));
        assert_eq!(op.outputs, vec![r]);
        assert!(flow.vars[t].dead);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (mut flow, ..) = simple_flow();
        flow.infer_inputs_and_outputs();
        let dir = std::env::temp_dir().join("cellflow_flow_test.json");
        flow.save(&dir).unwrap();
        let loaded = Flow::load(&dir).unwrap();
        assert_eq!(loaded.ops.len(), flow.ops.len());
        assert_eq!(loaded.vars[0].name, "x");
        assert_eq!(loaded.vars[2].producer, Some(0));
    }
}
