
use cmdbuf_rs::{
    hlo_module,
    ir::{
        ir_utils::tensor_type,
        spec::{ComputationBuilder, DType, ElementwiseUnaryOp, Operand, Operation, ValueId},
        ComputationIndexError,
    },
    passes::{command_buffer::CommandBufferError, ModulePass, PassError},
    CommandBufferConfig, CommandBufferOptions, CommandBufferScheduling, CommandKind,
    ExecutionThreadSet, Module,
};
use scheduling_support::{
    assert_module_eq, command_buffer_calls, computation, schedule, schedule_default, NEW_DEVICE,
    OLD_DEVICE,
};

const ADD_MUL: &str = r#"
module @scenario
entry func @main(%p0: tensor<f32, 4>, %p1: tensor<f32, 4>) -> tensor<f32, 4> {
  %add = add(%p0, %p1) -> tensor<f32, 4>
  %mul = mul(%add, %p0) -> tensor<f32, 4>
  return %mul
}
"#;

#[test]
fn outlines_a_single_run() {
    let mut module = hlo_module!(ADD_MUL);
    let result = schedule_default(&mut module);
    assert!(result.changed);
    assert_eq!(result.rewrites_applied, 1);
    assert_eq!(result.erased_insts, 2);

    assert_module_eq(
        &module,
        r#"
module @scenario
entry func @main(%p0: tensor<f32, 4>, %p1: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb = call(%p0, %p1) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4>
  return %cb
}
func @command_buffer(%a: tensor<f32, 4>, %b: tensor<f32, 4>) -> tensor<f32, 4> {
  %add = add(%a, %b) -> tensor<f32, 4>
  %mul = mul(%add, %a) -> tensor<f32, 4>
  return %mul
}
"#,
    );
}

#[test]
fn short_runs_stay_in_place() {
    let original = hlo_module!(ADD_MUL);
    let mut module = original.clone();
    let result = schedule(
        &mut module,
        NEW_DEVICE,
        CommandBufferOptions::default().with_min_num_commands(3),
    );
    assert!(!result.changed);
    assert_eq!(result.rewrites_applied, 0);
    assert_eq!(module, original);
}

const TWO_RUNS: &str = r#"
module @scenario
entry func @main(%p0: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p0) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  %h = custom_call(%b) target[host_callback] -> tensor<f32, 4>
  %c = tanh(%h) -> tensor<f32, 4>
  %d = add(%c, %p0) -> tensor<f32, 4>
  return %d
}
"#;

#[test]
fn boundary_splits_two_runs() {
    let mut module = hlo_module!(TWO_RUNS);
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 2);
    assert_eq!(result.erased_insts, 4);

    assert_module_eq(
        &module,
        r#"
module @scenario
entry func @main(%p0: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb0 = call(%p0) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4>
  %h = custom_call(%cb0) target[host_callback] -> tensor<f32, 4>
  %cb1 = call(%h, %p0) to_apply[@command_buffer.1] kind[command_buffer] -> tensor<f32, 4>
  return %cb1
}
func @command_buffer(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%x) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  return %b
}
func @command_buffer.1(%x: tensor<f32, 4>, %y: tensor<f32, 4>) -> tensor<f32, 4> {
  %c = tanh(%x) -> tensor<f32, 4>
  %d = add(%c, %y) -> tensor<f32, 4>
  return %d
}
"#,
    );
}

#[test]
fn disabled_kinds_produce_no_runs() {
    let original = hlo_module!(TWO_RUNS);
    let mut module = original.clone();
    let options = CommandBufferOptions::new(CommandBufferConfig::from_kinds([
        CommandKind::Cublas,
        CommandKind::While,
    ]));
    let result = schedule(&mut module, NEW_DEVICE, options);
    assert!(!result.changed);
    assert_eq!(module, original);

    let empty = CommandBufferOptions::new(CommandBufferConfig::empty());
    assert!(!schedule(&mut module, NEW_DEVICE, empty).changed);
    assert_eq!(module, original);
}

const GEMM_THEN_NEG: &str = r#"
module @gated
entry func @main(%p0: tensor<f32, 4x4>, %p1: tensor<f32, 4x4>) -> tensor<f32, 4x4> {
  %g = custom_call(%p0, %p1) target[__cublas$gemm] -> tensor<f32, 4x4>
  %n = neg(%g) -> tensor<f32, 4x4>
  return %n
}
"#;

#[test]
fn old_driver_makes_gated_kinds_boundaries() {
    let mut module = hlo_module!(GEMM_THEN_NEG);
    let result = schedule(&mut module, OLD_DEVICE, CommandBufferOptions::default());
    assert_eq!(result.rewrites_applied, 1);
    assert_module_eq(
        &module,
        r#"
module @gated
entry func @main(%p0: tensor<f32, 4x4>, %p1: tensor<f32, 4x4>) -> tensor<f32, 4x4> {
  %g = custom_call(%p0, %p1) target[__cublas$gemm] -> tensor<f32, 4x4>
  %cb = call(%g) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4x4>
  return %cb
}
func @command_buffer(%x: tensor<f32, 4x4>) -> tensor<f32, 4x4> {
  %n = neg(%x) -> tensor<f32, 4x4>
  return %n
}
"#,
    );

    let mut module = hlo_module!(GEMM_THEN_NEG);
    schedule_default(&mut module);
    let main = computation(&module, "main");
    assert_eq!(main.len(), 3);
    let buffer = computation(&module, "command_buffer");
    assert!(matches!(buffer.body[2].op, Operation::CustomCall(_)));
    assert!(matches!(buffer.body[3].op, Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg)));
}

#[test]
fn mixed_versions_fail_the_gate() {
    let mut module = hlo_module!(GEMM_THEN_NEG);
    let versions = cmdbuf_rs::DeviceVersions::new(12040, 12020);
    schedule(&mut module, versions, CommandBufferOptions::default());
    assert_eq!(
        computation(&module, "command_buffer").len(),
        2,
        "only the negation is outlined"
    );
}

#[test]
fn no_ops_join_runs_but_are_trimmed_at_the_end() {
    let mut module = hlo_module!(
        r#"
module @noops
entry func @main(%p0: tensor<f32, 4>) -> tensor<f32, 4> {
  %cast = bitcast(%p0) -> tensor<f32, 4>
  %a = neg(%cast) -> tensor<f32, 4>
  %b = bitcast(%a) -> tensor<f32, 4>
  %c = exp(%b) -> tensor<f32, 4>
  %d = bitcast(%c) -> tensor<f32, 4>
  return %d
}
"#
    );
    schedule_default(&mut module);
    assert_module_eq(
        &module,
        r#"
module @noops
entry func @main(%p0: tensor<f32, 4>) -> tensor<f32, 4> {
  %cast = bitcast(%p0) -> tensor<f32, 4>
  %cb = call(%cast) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4>
  %d = bitcast(%cb) -> tensor<f32, 4>
  return %d
}
func @command_buffer(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%x) -> tensor<f32, 4>
  %b = bitcast(%a) -> tensor<f32, 4>
  %c = exp(%b) -> tensor<f32, 4>
  return %c
}
"#,
    );
}

#[test]
fn threshold_ignores_no_ops() {
    let original = hlo_module!(
        r#"
module @noops
entry func @main(%p0: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p0) -> tensor<f32, 4>
  %b = bitcast(%a) -> tensor<f32, 4>
  %c = bitcast(%b) -> tensor<f32, 4>
  %d = exp(%c) -> tensor<f32, 4>
  return %d
}
"#
    );
    let mut module = original.clone();
    let three = CommandBufferOptions::default().with_min_num_commands(3);
    assert!(!schedule(&mut module, NEW_DEVICE, three).changed);
    assert_eq!(module, original);

    let two = CommandBufferOptions::default().with_min_num_commands(2);
    assert!(schedule(&mut module, NEW_DEVICE, two).changed);
    assert_eq!(computation(&module, "command_buffer").len(), 5);
}

#[test]
fn multiple_results_are_read_through_tuple_elements() {
    let mut module = hlo_module!(
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  %h = custom_call(%a, %b) target[host] -> tensor<f32, 4>
  return %h
}
"#
    );
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 1);
    assert_module_eq(
        &module,
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb = call(%p) to_apply[@command_buffer] kind[command_buffer] -> (tensor<f32, 4>, tensor<f32, 4>)
  %h = custom_call(%cb[0], %cb[1]) target[host] -> tensor<f32, 4>
  return %h
}
func @command_buffer(%x: tensor<f32, 4>) -> (tensor<f32, 4>, tensor<f32, 4>) {
  %a = neg(%x) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  %r = tuple(%a, %b) -> (tensor<f32, 4>, tensor<f32, 4>)
  return %r
}
"#,
    );
}

#[test]
fn root_result_gets_an_explicit_projection() {
    let mut module = hlo_module!(
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  %h = custom_call(%a) target[host] -> tensor<f32, 4>
  return %b
}
"#
    );
    schedule_default(&mut module);
    assert_module_eq(
        &module,
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb = call(%p) to_apply[@command_buffer] kind[command_buffer] -> (tensor<f32, 4>, tensor<f32, 4>)
  %root = get_tuple_element(%cb) index[1] -> tensor<f32, 4>
  %h = custom_call(%cb[0]) target[host] -> tensor<f32, 4>
  return %root
}
func @command_buffer(%x: tensor<f32, 4>) -> (tensor<f32, 4>, tensor<f32, 4>) {
  %a = neg(%x) -> tensor<f32, 4>
  %b = exp(%a) -> tensor<f32, 4>
  %r = tuple(%a, %b) -> (tensor<f32, 4>, tensor<f32, 4>)
  return %r
}
"#,
    );
}

#[test]
fn tuple_element_reads_of_results_go_through_projection() {
    let mut module = hlo_module!(
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %g = custom_call(%p) target[__cublas$lt$matmul] -> (tensor<f32, 4>, tensor<f32, 4>)
  %n = neg(%g[0]) -> tensor<f32, 4>
  %h = custom_call(%g[1], %n) target[host] -> tensor<f32, 4>
  return %h
}
"#
    );
    schedule_default(&mut module);
    assert_module_eq(
        &module,
        r#"
module @multi
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb = call(%p) to_apply[@command_buffer] kind[command_buffer] -> ((tensor<f32, 4>, tensor<f32, 4>), tensor<f32, 4>)
  %g = get_tuple_element(%cb) index[0] -> (tensor<f32, 4>, tensor<f32, 4>)
  %h = custom_call(%g[1], %cb[1]) target[host] -> tensor<f32, 4>
  return %h
}
func @command_buffer(%x: tensor<f32, 4>) -> ((tensor<f32, 4>, tensor<f32, 4>), tensor<f32, 4>) {
  %g = custom_call(%x) target[__cublas$lt$matmul] -> (tensor<f32, 4>, tensor<f32, 4>)
  %n = neg(%g[0]) -> tensor<f32, 4>
  %r = tuple(%g, %n) -> ((tensor<f32, 4>, tensor<f32, 4>), tensor<f32, 4>)
  return %r
}
"#,
    );
}

#[test]
fn constants_are_hoisted_before_collecting() {
    let mut module = hlo_module!(
        r#"
module @leaves
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p) -> tensor<f32, 4>
  %two = constant splat[2.0] -> tensor<f32, 4>
  %b = add(%a, %two) -> tensor<f32, 4>
  return %b
}
"#
    );
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 1);
    assert_module_eq(
        &module,
        r#"
module @leaves
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %two = constant splat[2.0] -> tensor<f32, 4>
  %cb = call(%p, %two) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4>
  return %cb
}
func @command_buffer(%x: tensor<f32, 4>, %y: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%x) -> tensor<f32, 4>
  %b = add(%a, %y) -> tensor<f32, 4>
  return %b
}
"#,
    );
}

const WHILE_LOOP: &str = r#"
module @loop
func @cond(%s: tensor<f32, 4>) -> tensor<i1> {
  %r = custom_call(%s) target[is_done] command_buffer_compatible[true] -> tensor<i1>
  return %r
}
func @body(%s: tensor<f32, 4>) -> tensor<f32, 4> {
  %one = constant splat[1.0] -> tensor<f32, 4>
  %n = add(%s, %one) -> tensor<f32, 4>
  return %n
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%p) -> tensor<f32, 4>
  %w = while(%a) condition[@cond] body[@body] -> tensor<f32, 4>
  %e = exp(%w) -> tensor<f32, 4>
  return %e
}
"#;

#[test]
fn while_with_command_bodies_is_recorded_whole() {
    let mut module = hlo_module!(WHILE_LOOP);
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 1);
    assert_module_eq(
        &module,
        r#"
module @loop
func @cond(%s: tensor<f32, 4>) -> tensor<i1> {
  %r = custom_call(%s) target[is_done] command_buffer_compatible[true] -> tensor<i1>
  return %r
}
func @body(%s: tensor<f32, 4>) -> tensor<f32, 4> {
  %one = constant splat[1.0] -> tensor<f32, 4>
  %n = add(%s, %one) -> tensor<f32, 4>
  return %n
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %cb = call(%p) to_apply[@command_buffer] kind[command_buffer] -> tensor<f32, 4>
  return %cb
}
func @command_buffer(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = neg(%x) -> tensor<f32, 4>
  %w = while(%a) condition[@cond] body[@body] -> tensor<f32, 4>
  %e = exp(%w) -> tensor<f32, 4>
  return %e
}
"#,
    );
}

#[test]
fn while_on_old_device_splits_runs_and_nested_bodies_are_visited() {
    let mut module = hlo_module!(WHILE_LOOP);
    let result = schedule(&mut module, OLD_DEVICE, CommandBufferOptions::default());
    assert_eq!(result.rewrites_applied, 3);

    let main = computation(&module, "main");
    assert!(main.body.iter().any(|inst| matches!(inst.op, Operation::While(_))));
    assert_eq!(
        command_buffer_calls(&module, main),
        vec!["command_buffer", "command_buffer.1"]
    );
    let body = computation(&module, "body");
    assert_eq!(command_buffer_calls(&module, body), vec!["command_buffer.2"]);
    assert!(command_buffer_calls(&module, computation(&module, "cond")).is_empty());
}

#[test]
fn while_with_host_work_in_body_is_a_boundary() {
    let mut module = hlo_module!(
        r#"
module @loop
func @cond(%s: tensor<f32, 4>) -> tensor<i1> {
  %r = custom_call(%s) target[is_done] command_buffer_compatible[true] -> tensor<i1>
  return %r
}
func @body(%s: tensor<f32, 4>) -> tensor<f32, 4> {
  %n = custom_call(%s) target[host_step] -> tensor<f32, 4>
  return %n
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %w = while(%p) condition[@cond] body[@body] -> tensor<f32, 4>
  return %w
}
"#
    );
    schedule_default(&mut module);
    let main = computation(&module, "main");
    assert!(command_buffer_calls(&module, main).is_empty());
    assert!(matches!(main.body[1].op, Operation::While(_)));
    assert!(command_buffer_calls(&module, computation(&module, "body")).is_empty());
    assert_eq!(
        command_buffer_calls(&module, computation(&module, "cond")),
        vec!["command_buffer"]
    );
}

#[test]
fn conditional_branches_move_with_the_conditional() {
    let mut module = hlo_module!(
        r#"
module @branchy
func @then(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %n = neg(%x) -> tensor<f32, 4>
  return %n
}
func @else(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %r = all_reduce(%x) -> tensor<f32, 4>
  return %r
}
entry func @main(%sel: tensor<si32>, %p: tensor<f32, 4>) -> tensor<f32, 4> {
  %c = conditional(%sel, %p, %p) branches[@then, @else] -> tensor<f32, 4>
  return %c
}
"#
    );
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 1);
    let buffer = computation(&module, "command_buffer");
    assert!(buffer.body.iter().any(|inst| matches!(inst.op, Operation::Conditional(_))));
    assert!(command_buffer_calls(&module, computation(&module, "then")).is_empty());
    assert!(command_buffer_calls(&module, computation(&module, "else")).is_empty());
}

#[test]
fn fusion_kernels_are_never_rewritten() {
    let mut module = hlo_module!(
        r#"
module @fused
func @kernel(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = exp(%x) -> tensor<f32, 4>
  %b = neg(%a) -> tensor<f32, 4>
  return %b
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %f = fusion(%p) kind[loop] calls[@kernel] -> tensor<f32, 4>
  %g = fusion(%f) kind[loop] calls[@kernel] -> tensor<f32, 4>
  return %g
}
"#
    );
    let kernel_before = computation(&module, "kernel").clone();
    let result = schedule_default(&mut module);
    assert_eq!(result.rewrites_applied, 1);
    assert_eq!(computation(&module, "kernel"), &kernel_before);
    assert_eq!(computation(&module, "command_buffer").len(), 3);
}

#[test]
fn thread_filter_limits_the_computations_visited() {
    const THREADS: &str = r#"
module @threads
func @side(%x: tensor<f32, 4>) -> tensor<f32, 4> thread[host] {
  %a = neg(%x) -> tensor<f32, 4>
  return %a
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %a = exp(%p) -> tensor<f32, 4>
  return %a
}
"#;
    let mut module = hlo_module!(THREADS);
    let pass = CommandBufferScheduling::new(NEW_DEVICE, CommandBufferOptions::default());
    let result = pass
        .run_module(&mut module, &ExecutionThreadSet::only(["main"]))
        .expect("schedule main thread");
    assert_eq!(result.rewrites_applied, 1);
    assert!(command_buffer_calls(&module, computation(&module, "side")).is_empty());

    let mut module = hlo_module!(THREADS);
    pass.run_module(&mut module, &ExecutionThreadSet::only(["host"]))
        .expect("schedule host thread");
    assert!(command_buffer_calls(&module, computation(&module, "main")).is_empty());
    assert_eq!(computation(&module, "command_buffer").execution_thread, "host");
}

#[test]
fn second_run_is_a_no_op() {
    for src in [ADD_MUL, TWO_RUNS, WHILE_LOOP] {
        let mut module = hlo_module!(src);
        assert!(schedule_default(&mut module).changed);
        let once = module.clone();
        let again = schedule_default(&mut module);
        assert!(!again.changed, "second run changed:\n{module}");
        assert_eq!(module, once);
    }
}

#[test]
fn buffer_names_skip_existing_computations() {
    let mut module = hlo_module!(
        r#"
module @names
func @command_buffer(%x: tensor<f32, 4>) -> tensor<f32, 4> {
  %h = custom_call(%x) target[host] -> tensor<f32, 4>
  return %h
}
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %c = call(%p) to_apply[@command_buffer] -> tensor<f32, 4>
  %n = neg(%c) -> tensor<f32, 4>
  return %n
}
"#
    );
    schedule_default(&mut module);
    assert_eq!(
        command_buffer_calls(&module, computation(&module, "main")),
        vec!["command_buffer.1"]
    );
}

#[test]
fn malformed_computation_aborts_the_run() {
    let ty = tensor_type(DType::F32, &[4]);
    let mut builder = ComputationBuilder::new();
    builder.add_parameter(ty.clone());
    let neg = builder.emit(
        Operation::ElementwiseUnary(ElementwiseUnaryOp::Neg),
        vec![Operand::Value(ValueId(99))],
        ty,
    );
    let mut module = Module::new("broken");
    module.add_computation(builder.finish("main", neg));

    let pass = CommandBufferScheduling::new(NEW_DEVICE, CommandBufferOptions::default());
    let err = pass
        .run(&mut module, &ExecutionThreadSet::all())
        .expect_err("undefined operand");
    match err {
        PassError::CommandBuffer(err) => assert_eq!(
            err,
            CommandBufferError::Index {
                computation: "main".to_string(),
                source: ComputationIndexError::MissingValueDefinition { value: ValueId(99) },
            }
        ),
    }
    assert_eq!(module.computations.len(), 1);
}

#[test]
fn runs_nothing_reads_are_left_in_place() {
    const DEAD: &str = r#"
module @dead
entry func @main(%p: tensor<f32, 4>) -> tensor<f32, 4> {
  %d = neg(%p) -> tensor<f32, 4>
  %e = exp(%d) -> tensor<f32, 4>
  %h = custom_call(%p) target[host] -> tensor<f32, 4>
  %two = constant splat[2.0] -> tensor<f32, 4>
  return %h
}
"#;
    let mut module = hlo_module!(DEAD);
    let result = schedule_default(&mut module);
    assert!(!result.changed);
    assert_eq!(result.rewrites_applied, 0);
    // The constant stays put too: leaves are only hoisted where a buffer is lifted.
    assert_module_eq(&module, DEAD);
    assert!(command_buffer_calls(&module, computation(&module, "main")).is_empty());
}
