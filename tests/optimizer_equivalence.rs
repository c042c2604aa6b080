//! The peephole passes must preserve observable behavior: same print
//! trace, same final top of stack, for every program in the corpus.

use cellvm::{compile_source, parse_forms, link, optimize, Compiler, Program, Vm, VmConfig};

const CORPUS: &[&str] = &[
    "(+ 8 (- 10 3))",
    "(define k 10) (print (+ 3 (+ k 2)))",
    "(define fact (lambda (n) (cond (eq n 0) 1 (1) (* n (fact (- n 1)))))) (print (fact 6))",
    "(define mk (lambda (x) (lambda (y) (+ x y)))) (define f (mk 10)) (print (f 32))",
    "(define sub3 (lambda (a b c) (- (- a b) c))) (print (sub3 100 30 7))",
    "(define five (lambda () 5)) (print (five))",
    "(define addn (lambda (n) (lambda (m) (+ n m)))) (define a5 (addn 5)) (print (a5 37))",
    "(define cls (lambda (x) (cond (eq x 1) 11 (eq x 2) 22 (1) 99))) \
     (print (cls 1)) (print (cls 2)) (print (cls 3))",
    "(define len (lambda (l) (cond (null? l) 0 (1) (+ 1 (len (cdr l)))))) \
     (print (len (cons 1 (cons 2 (cons 3 Nil)))))",
    "(define twice (lambda (f x) (f (f x)))) (define inc (lambda (n) (+ n 1))) \
     (print (twice inc 40))",
];

fn run(src: &str, optimize_blobs: bool) -> (Vec<u8>, Option<i64>) {
    let program = compile_source(src, optimize_blobs).expect("compiles");
    let mut vm = Vm::new(&VmConfig::default());
    vm.capture_output();
    vm.run(&program).expect("runs");
    let top = vm.stack_top().map(|c| c.raw() as i64);
    (vm.take_output(), top)
}

#[test]
fn optimized_programs_behave_identically() {
    for src in CORPUS {
        let (out_plain, top_plain) = run(src, false);
        let (out_opt, top_opt) = run(src, true);
        assert_eq!(out_plain, out_opt, "print trace diverged for {src}");
        assert_eq!(top_plain, top_opt, "final stack top diverged for {src}");
    }
}

#[test]
fn optimized_programs_are_shorter() {
    let src = "(define fact (lambda (n) (cond (eq n 0) 1 (1) (* n (fact (- n 1)))))) (fact 6)";
    let plain = compile_source(src, false).unwrap();
    let optimized = compile_source(src, true).unwrap();
    assert!(optimized.len() < plain.len());
}

#[test]
fn pass_statistics_report_removals() {
    let forms = parse_forms(
        "(define f (lambda (a) (cond (eq a 0) 1 (1) 2))) (f 1)",
    )
    .unwrap();
    let mut compiled = Compiler::new().compile(&forms).unwrap();
    let stats = optimize(&mut compiled);
    // the (1) sentinel clause folds, the binding of a elides
    assert!(stats.cond_removed >= 3);
    assert!(stats.funarg_removed >= 6);
    assert!(link(compiled).is_ok());
}

#[test]
fn bytecode_text_roundtrip_preserves_behavior() {
    for src in CORPUS {
        let program = compile_source(src, true).expect("compiles");
        let text = program.to_string();
        let reparsed = Program::parse(&text).expect("parses back");
        assert_eq!(&reparsed, &program);

        let mut vm = Vm::new(&VmConfig::default());
        vm.capture_output();
        vm.run(&reparsed).expect("runs");
        let (direct_out, _) = run(src, true);
        assert_eq!(vm.take_output(), direct_out);
    }
}
