//! Fusion and rewrite tests through the full compiler
//!
//! Verifies that the graph transformations performed during analysis
//! (simplification, constant folding, expression fusion) produce the
//! expected compiled steps and preserve the computed results.

use cellflow::compiler::compile;
use cellflow::compute::{CompileOptions, Instance, Network};
use cellflow::flow::{DataType, Flow, Shape};
use cellflow::kernels::standard_library;
use cellflow::runtime::HostRuntime;
use std::sync::Arc;

fn compile_flow(flow: Flow) -> Network {
    let library = standard_library();
    compile(
        flow,
        &library,
        Arc::new(HostRuntime::new()),
        CompileOptions::default(),
    )
    .unwrap()
}

fn cell_steps<'a>(net: &'a Network, name: &str) -> Vec<&'a cellflow::compute::Step> {
    let cell = net.find_cell(name).unwrap();
    net.cells[cell].steps.iter().map(|&s| &net.steps[s]).collect()
}

// ============================================================================
// Element-wise fusion
// ============================================================================

#[test]
fn test_chain_fuses_to_single_step() {
    let mut flow = Flow::new();
    let f = flow.add_func("poly");
    let shape = Shape::of(&[3]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let y = flow.add_var("y", DataType::Float32, shape.clone());
    let z = flow.add_var("z", DataType::Float32, shape.clone());
    let t = flow.add_var("t", DataType::Float32, shape.clone());
    let r = flow.add_var("r", DataType::Float32, shape.clone());
    flow.add_op(f, "add", "Add", &[x, y], &[t]);
    flow.add_op(f, "mul", "Mul", &[t, z], &[r]);

    let net = compile_flow(flow);
    let steps = cell_steps(&net, "poly");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].kind, "Calculate");
    assert_eq!(steps[0].attr("expr"), Some("@0=Mul(Add(%0,%1),%2)"));

    let cell = net.find_cell("poly").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, 2.0, 3.0]);
    instance.set_f32(net.get_parameter("y").unwrap(), &[4.0, 5.0, 6.0]);
    instance.set_f32(net.get_parameter("z").unwrap(), &[2.0, 2.0, 2.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("r").unwrap()),
        vec![10.0, 14.0, 18.0]
    );
}

#[test]
fn test_shared_intermediate_stays_materialized() {
    // The intermediate is consumed by two steps and is a function output,
    // so producer fusion must keep it addressable.
    let mut flow = Flow::new();
    let f = flow.add_func("branch");
    let shape = Shape::of(&[4]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let t = flow.add_var("t", DataType::Float32, shape.clone());
    let a = flow.add_var("a", DataType::Float32, shape.clone());
    let b = flow.add_var("b", DataType::Float32, shape.clone());
    flow.add_op(f, "base", "Add", &[x, x], &[t]);
    flow.add_op(f, "left", "Neg", &[t], &[a]);
    flow.add_op(f, "right", "Relu", &[t], &[b]);
    flow.vars[t].output = true;

    let net = compile_flow(flow);
    let cell = net.find_cell("branch").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, -2.0, 3.0, -4.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("t").unwrap()),
        vec![2.0, -4.0, 6.0, -8.0]
    );
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("a").unwrap()),
        vec![-2.0, 4.0, -6.0, 8.0]
    );
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("b").unwrap()),
        vec![2.0, 0.0, 6.0, 0.0]
    );
}

#[test]
fn test_sibling_fusion_on_shared_input() {
    // Two element-wise consumers of the same variable merge into one step
    // with two outputs.
    let mut flow = Flow::new();
    let f = flow.add_func("fork");
    let shape = Shape::of(&[4]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let a = flow.add_var("a", DataType::Float32, shape.clone());
    let b = flow.add_var("b", DataType::Float32, shape.clone());
    flow.add_op(f, "neg", "Neg", &[x], &[a]);
    flow.add_op(f, "relu", "Relu", &[x], &[b]);

    let net = compile_flow(flow);
    let steps = cell_steps(&net, "fork");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].outputs.len(), 2);

    // The two outputs must not collapse onto the same storage.
    let a_t = net.get_parameter("a").unwrap();
    let b_t = net.get_parameter("b").unwrap();
    assert_ne!(net.storage_root(a_t), net.storage_root(b_t));

    let cell = net.find_cell("fork").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, -2.0, 3.0, -4.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("a").unwrap()),
        vec![-1.0, 2.0, -3.0, 4.0]
    );
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("b").unwrap()),
        vec![1.0, 0.0, 3.0, 0.0]
    );
}

#[test]
fn test_fused_outputs_keep_distinct_storage() {
    // A fused step with several outputs reading the same intermediate must
    // write each output to its own storage.
    let mut flow = Flow::new();
    let f = flow.add_func("chain");
    let shape = Shape::of(&[3]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let y = flow.add_var("y", DataType::Float32, shape.clone());
    let t = flow.add_var("t", DataType::Float32, shape.clone());
    let r = flow.add_var("r", DataType::Float32, shape.clone());
    let s = flow.add_var("s", DataType::Float32, shape.clone());
    flow.add_op(f, "base", "Add", &[x, y], &[t]);
    flow.add_op(f, "scale", "Mul", &[t, x], &[r]);
    flow.add_op(f, "diff", "Sub", &[t, y], &[s]);
    flow.vars[t].output = true;

    let net = compile_flow(flow);
    let r_t = net.get_parameter("r").unwrap();
    let s_t = net.get_parameter("s").unwrap();
    assert_ne!(net.storage_root(r_t), net.storage_root(s_t));

    let cell = net.find_cell("chain").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, 2.0, 3.0]);
    instance.set_f32(net.get_parameter("y").unwrap(), &[10.0, 20.0, 30.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("t").unwrap()),
        vec![11.0, 22.0, 33.0]
    );
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("r").unwrap()),
        vec![11.0, 44.0, 99.0]
    );
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("s").unwrap()),
        vec![1.0, 2.0, 3.0]
    );
}

#[test]
fn test_reduction_blocks_fusion() {
    // A consumer of a reduction result cannot be folded into the reduction
    // step, so the chain compiles to two steps.
    let mut flow = Flow::new();
    let f = flow.add_func("total");
    let x = flow.add_var("x", DataType::Float32, Shape::of(&[8]));
    let s = flow.add_var("s", DataType::Float32, Shape::of(&[1]));
    let r = flow.add_var("r", DataType::Float32, Shape::of(&[1]));
    flow.add_op(f, "sum", "Sum", &[x], &[s]);
    flow.add_op(f, "neg", "Neg", &[s], &[r]);

    let net = compile_flow(flow);
    let steps = cell_steps(&net, "total");
    assert_eq!(steps.len(), 2);

    let cell = net.find_cell("total").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(
        net.get_parameter("x").unwrap(),
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
    );
    instance.compute().unwrap();
    assert_eq!(instance.get_elem::<f32>(net.get_parameter("r").unwrap(), 0), -36.0);
}

// ============================================================================
// Simplification and folding
// ============================================================================

#[test]
fn test_division_by_constant_simplifies_and_fuses() {
    let mut flow = Flow::new();
    let f = flow.add_func("halve");
    let shape = Shape::of(&[4]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let y = flow.add_var("y", DataType::Float32, shape.clone());
    let two = flow.add_const_f32("two", Shape::scalar(), &[2.0]);
    let t = flow.add_var("t", DataType::Float32, shape.clone());
    let r = flow.add_var("r", DataType::Float32, shape.clone());
    flow.add_op(f, "div", "Div", &[x, two], &[t]);
    flow.add_op(f, "add", "Add", &[t, y], &[r]);

    let net = compile_flow(flow);
    let steps = cell_steps(&net, "halve");
    assert_eq!(steps.len(), 1);
    // The division became a multiplication by the reciprocal.
    assert!(steps[0].attr("expr").unwrap().contains("Mul"));
    assert!(!steps[0].attr("expr").unwrap().contains("Div"));

    let cell = net.find_cell("halve").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[2.0, 4.0, 6.0, 8.0]);
    instance.set_f32(net.get_parameter("y").unwrap(), &[1.0, 1.0, 1.0, 1.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("r").unwrap()),
        vec![2.0, 3.0, 4.0, 5.0]
    );
}

#[test]
fn test_constant_subgraph_folds_away() {
    let mut flow = Flow::new();
    let f = flow.add_func("offset");
    let shape = Shape::of(&[2]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let a = flow.add_const_f32("a", shape.clone(), &[1.0, 2.0]);
    let b = flow.add_const_f32("b", shape.clone(), &[10.0, 20.0]);
    let t = flow.add_var("t", DataType::Float32, shape.clone());
    let r = flow.add_var("r", DataType::Float32, shape.clone());
    flow.add_op(f, "cadd", "Add", &[a, b], &[t]);
    flow.add_op(f, "add", "Add", &[x, t], &[r]);

    let net = compile_flow(flow);
    let steps = cell_steps(&net, "offset");
    assert_eq!(steps.len(), 1);

    let cell = net.find_cell("offset").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, 1.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("r").unwrap()),
        vec![12.0, 23.0]
    );
}

#[test]
fn test_negated_comparison_complements() {
    let mut flow = Flow::new();
    let f = flow.add_func("cmp");
    let shape = Shape::of(&[4]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let y = flow.add_var("y", DataType::Float32, shape.clone());
    let eq = flow.add_var("eq", DataType::Float32, shape.clone());
    let ne = flow.add_var("ne", DataType::Float32, shape.clone());
    flow.add_op(f, "equal", "Equal", &[x, y], &[eq]);
    flow.add_op(f, "not", "Not", &[eq], &[ne]);

    let net = compile_flow(flow);
    let cell = net.find_cell("cmp").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    instance.set_f32(net.get_parameter("y").unwrap(), &[1.0, 0.0, 3.0, 0.0]);
    instance.compute().unwrap();
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("ne").unwrap()),
        vec![0.0, 1.0, 0.0, 1.0]
    );
}

#[test]
fn test_select_expression() {
    let mut flow = Flow::new();
    let f = flow.add_func("pick");
    let shape = Shape::of(&[4]);
    let x = flow.add_var("x", DataType::Float32, shape.clone());
    let y = flow.add_var("y", DataType::Float32, shape.clone());
    let lt = flow.add_var("lt", DataType::Float32, shape.clone());
    let r = flow.add_var("r", DataType::Float32, shape.clone());
    flow.add_op(f, "less", "Less", &[x, y], &[lt]);
    flow.add_op(f, "sel", "Select", &[lt, x, y], &[r]);

    let net = compile_flow(flow);
    let cell = net.find_cell("pick").unwrap();
    let mut instance = Instance::new(&net, cell).unwrap();
    instance.set_f32(net.get_parameter("x").unwrap(), &[1.0, 5.0, 2.0, 9.0]);
    instance.set_f32(net.get_parameter("y").unwrap(), &[3.0, 3.0, 3.0, 3.0]);
    instance.compute().unwrap();
    // Element-wise minimum via compare and select.
    assert_eq!(
        instance.to_vec_f32(net.get_parameter("r").unwrap()),
        vec![1.0, 3.0, 2.0, 3.0]
    );
}
