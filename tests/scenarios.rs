//! End-to-end scenarios: source through the compiler, linker, and VM.

use cellvm::{compile_source, Op, Tag, Vm, VmConfig, VmError};

fn run_with(src: &str, optimize: bool, config: &VmConfig) -> (Vec<u8>, Vm) {
    let program = compile_source(src, optimize).expect("compiles");
    let mut vm = Vm::new(config);
    vm.capture_output();
    vm.run(&program).expect("runs to FIN");
    (vm.take_output(), vm)
}

fn run(src: &str, optimize: bool) -> (Vec<u8>, Vm) {
    run_with(src, optimize, &VmConfig::default())
}

#[test]
fn constant_fold() {
    let program = compile_source("(+ 8 (- 10 3))", false).unwrap();
    assert_eq!(
        program.ops(),
        &[
            Op::PushCi(8),
            Op::PushCi(10),
            Op::PushCi(3),
            Op::Sub,
            Op::Add,
            Op::Fin,
        ]
    );
    let (_, vm) = run("(+ 8 (- 10 3))", false);
    assert_eq!(vm.stack_top().unwrap().as_int(), 15);
}

#[test]
fn define_and_use() {
    let (out, vm) = run("(define k 10) (print (+ 3 (+ k 2)))", false);
    assert_eq!(out, b"15");
    // the binding (k . 10) heads the global environment
    let env = vm.heap().get(vm.env_ptr());
    let binding = vm.heap().get(env.pair_left());
    assert_eq!(vm.heap().get(binding.pair_left()).tag(), Tag::String);
    assert_eq!(vm.heap().get(binding.pair_right()).as_int(), 10);
}

const FACT: &str = "(define fact (lambda (n) (cond (eq n 0) 1 (1) (* n (fact (- n 1)))))) \
                    (print (fact 6))";

#[test]
fn recursive_lambda() {
    assert_eq!(run(FACT, false).0, b"720");
    assert_eq!(run(FACT, true).0, b"720");
}

const CLOSURE: &str = "(define mk (lambda (x) (lambda (y) (+ x y)))) \
                       (define f (mk 10)) (print (f 32))";

#[test]
fn closure_capture() {
    assert_eq!(run(CLOSURE, false).0, b"42");
    assert_eq!(run(CLOSURE, true).0, b"42");
}

#[test]
fn closure_retains_captured_values_after_rebinding() {
    // f capture of x=10 must survive a later shadowing definition
    let src = "(define mk (lambda (x) (lambda (y) (+ x y)))) \
               (define f (mk 10)) (define x 99) (print (f 32))";
    assert_eq!(run(src, false).0, b"42");
}

#[test]
fn gc_survival() {
    let src = "(define loop (lambda (i) (cond (eq i 0) 7 (1) \
               (begin (cons i Nil) (loop (- i 1)))))) (print (loop 30))";
    let config = VmConfig {
        heap_size: 400,
        ..VmConfig::default()
    };
    let (out, vm) = run_with(src, false, &config);
    assert_eq!(out, b"7");
    assert!(vm.heap().gc_count() >= 1, "collector should have run");
    let (out, _) = run_with(src, true, &config);
    assert_eq!(out, b"7");
}

#[test]
fn closure_environment_survives_collection() {
    let src = "(define mk (lambda (x) (lambda (y) (+ x y)))) \
               (define f (mk 10)) \
               (define burn (lambda (i) (cond (eq i 0) 0 (1) \
               (begin (cons i Nil) (burn (- i 1)))))) \
               (begin (burn 40) (print (f 32)))";
    let config = VmConfig {
        heap_size: 500,
        ..VmConfig::default()
    };
    let (out, vm) = run_with(src, false, &config);
    assert_eq!(out, b"42");
    assert!(vm.heap().gc_count() >= 1);
}

#[test]
fn spigot_pi_38_digits() {
    let src = include_str!("../demos/pi.lsp");
    let config = VmConfig {
        stack_size: 4096,
        ..VmConfig::default()
    };
    let (out, vm) = run_with(src, false, &config);
    assert_eq!(out, b"31415926535897932384626433832795028841");
    assert!(vm.heap().gc_count() >= 1);
    let (out, _) = run_with(src, true, &config);
    assert_eq!(out, b"31415926535897932384626433832795028841");
}

#[test]
fn type_predicates() {
    let src = "(print (null? Nil)) (print (null? 4)) (print (int? 4)) \
               (print (str? (cons 1 2))) \
               (define g (lambda (x) x)) (print (func? g))";
    assert_eq!(run(src, false).0, b"10101");
}

#[test]
fn begin_sequences_and_keeps_the_last_value() {
    let (out, vm) = run("(begin (print 1) (print 2) 3)", false);
    assert_eq!(out, b"12");
    assert_eq!(vm.stack_top().unwrap().as_int(), 3);
}

#[test]
fn cond_selects_the_matching_clause() {
    let src = "(define cls (lambda (x) (cond (eq x 1) 11 (eq x 2) 22 (1) 99))) \
               (print (cls 1)) (print (cls 2)) (print (cls 3))";
    assert_eq!(run(src, false).0, b"112299");
    assert_eq!(run(src, true).0, b"112299");
}

#[test]
fn computed_callee_in_head_position() {
    assert_eq!(run("(print ((lambda (x) (* x x)) 7))", false).0, b"49");
}

#[test]
fn lists_via_cons_car_cdr() {
    let src = "(define l (cons 1 (cons 2 Nil))) \
               (print (car l)) (print (car (cdr l))) (print (null? (cdr (cdr l))))";
    assert_eq!(run(src, false).0, b"121");
}

#[test]
fn gc_form_yields_nil() {
    let (out, vm) = run("(print (gc))", false);
    assert_eq!(out, b"Nil\n");
    assert_eq!(vm.heap().gc_count(), 1);
}

#[test]
fn unbound_symbol_panics() {
    let program = compile_source("(print nosuch)", false).unwrap();
    let mut vm = Vm::new(&VmConfig::default());
    vm.capture_output();
    let err = vm.run(&program).unwrap_err();
    // the lookup walks off the chain onto the Nil slot
    assert!(matches!(err, VmError::TypeMismatch { .. }));
}

#[test]
fn deep_recursion_overflows_the_fixed_stack() {
    let src = "(define down (lambda (n) (cond (eq n 0) 0 (1) (down (- n 1))))) (down 500)";
    let program = compile_source(src, false).unwrap();
    let mut vm = Vm::new(&VmConfig::default());
    vm.capture_output();
    let err = vm.run(&program).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow { .. }));
}

#[test]
fn negative_numbers_print_signed() {
    assert_eq!(run("(print (- 3 10))", false).0, b"-7");
    assert_eq!(run("(print (less (- 0 1) 0))", false).0, b"1");
}

#[test]
fn top_level_forms_accumulate_their_values() {
    let (_, vm) = run("(define a 1) (define b 2) (+ a b)", false);
    // one leftover value per form
    assert_eq!(vm.stack_depth(), 3);
    assert_eq!(vm.stack_top().unwrap().as_int(), 3);
}
