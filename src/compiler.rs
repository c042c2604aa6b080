//! Tree-walking compiler from parsed forms to bytecode.
//!
//! Every lambda compiles into its own function blob stored in a side
//! table; the parent emits `PUSHL <table index>` which the linker later
//! rewrites to the blob's absolute pc. Symbol references compile to an
//! inline linear search over the environment chain; `cond` lowers to
//! relative branches whose offsets are fixed at emission time.

use tracing::debug;

use crate::cell::Sym;
use crate::program::Op;
use crate::sexpr::SExpr;

/// A compiled program before linking: the main body plus the lambda
/// blob table. Offsets inside blobs are final; `PUSHL` operands are
/// still table indices.
#[derive(Debug, Clone, Default)]
pub struct CompiledForms {
    pub main: Vec<Op>,
    pub functions: Vec<Vec<Op>>,
}

/// Compile-time failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// A symbol that does not fit the runtime's 7-byte field.
    LongSymbol(String),
    /// A special form with the wrong shape, e.g. `(define x)`.
    BadForm(String),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LongSymbol(s) => write!(f, "long names are not supported: {s}"),
            Self::BadForm(s) => write!(f, "malformed form: {s}"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Number of instructions in the inline symbol-lookup sequence.
pub const LOOKUP_LEN: usize = 15;

/// Stack cells between a callee's last argument and its first free
/// slot: the spent lambda slot, the saved pc, and the saved env.
pub const FRAME_OVERHEAD: usize = 3;

pub struct Compiler {
    functions: Vec<Vec<Op>>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Compiler {
            functions: Vec::new(),
        }
    }

    /// Compile top-level forms into a main body (terminated by `FIN`)
    /// and the function table.
    pub fn compile(mut self, forms: &[SExpr]) -> Result<CompiledForms, CompileError> {
        let mut main = Vec::new();
        for form in forms {
            self.compile_expr(form, &mut main)?;
        }
        main.push(Op::Fin);
        debug!(
            target: "cellvm::compiler",
            main_len = main.len(),
            functions = self.functions.len(),
            "compiled"
        );
        Ok(CompiledForms {
            main,
            functions: self.functions,
        })
    }

    fn sym(name: &str) -> Result<Sym, CompileError> {
        Sym::new(name).map_err(|e| CompileError::LongSymbol(e.0))
    }

    /// Emit the inline environment search for a symbol reference. The
    /// loop takes the head binding pair of each environment link,
    /// compares its name, and either keeps the bound value or steps to
    /// the outer environment. Termination is the program's
    /// responsibility: past the root the walk reaches the Nil slot and
    /// the next `PUSHCAR` stops the VM with a type panic.
    fn compile_symbol(name: &str, out: &mut Vec<Op>) -> Result<(), CompileError> {
        if name == "Nil" {
            out.push(Op::PushNil);
            return Ok(());
        }
        out.extend([
            Op::LoadEnv,
            Op::PushCar,
            Op::PushCar,
            Op::Eqsi(Self::sym(name)?),
            Op::Rjnz(6),
            Op::Pop,
            Op::Pop,
            Op::Pop,
            Op::Cdr,
            Op::Rjmp(-8),
            Op::Pop,
            Op::Pop,
            Op::Cdr,
            Op::Swap(0),
            Op::Pop,
        ]);
        Ok(())
    }

    fn compile_args(&mut self, list: &[SExpr], out: &mut Vec<Op>) -> Result<(), CompileError> {
        for arg in &list[1..] {
            self.compile_expr(arg, out)?;
        }
        Ok(())
    }

    /// Lower a type predicate: push a sentinel of the target type,
    /// compare tags, then shuffle the two operands out from under the
    /// flag.
    fn compile_predicate(
        &mut self,
        list: &[SExpr],
        sentinel: Op,
        out: &mut Vec<Op>,
    ) -> Result<(), CompileError> {
        self.compile_args(list, out)?;
        out.push(sentinel);
        out.extend([Op::Eqt, Op::Swap(1), Op::Pop, Op::Pop]);
        Ok(())
    }

    fn compile_cond(&mut self, list: &[SExpr], out: &mut Vec<Op>) -> Result<(), CompileError> {
        let clauses = &list[1..];
        if clauses.is_empty() || clauses.len() % 2 != 0 {
            return Err(CompileError::BadForm(
                "cond expects predicate/result pairs".into(),
            ));
        }
        let mut conds = Vec::new();
        let mut results = Vec::new();
        for (i, expr) in clauses.iter().enumerate() {
            let mut buf = Vec::new();
            self.compile_expr(expr, &mut buf)?;
            if i % 2 == 0 {
                conds.push(buf);
            } else {
                results.push(buf);
            }
        }
        let n = conds.len();
        for i in 0..n {
            if i != 0 {
                // discard the previous clause's false flag
                out.push(Op::Pop);
            }
            out.extend(conds[i].iter().cloned());
            if i != n - 1 {
                out.push(Op::Rjz(results[i].len() as i32 + 3));
            } else {
                out.push(Op::Rjz(results[i].len() as i32 + 2));
            }
            out.push(Op::Pop);
            out.extend(results[i].iter().cloned());
            if i != n - 1 {
                let jump: usize = (i + 1..n)
                    .map(|j| conds[j].len() + results[j].len() + 4)
                    .sum();
                out.push(Op::Rjmp(jump as i32));
            }
        }
        Ok(())
    }

    fn compile_lambda(&mut self, list: &[SExpr], out: &mut Vec<Op>) -> Result<(), CompileError> {
        let (formals, body) = match list {
            [_, SExpr::List(formals), body] => (formals, body),
            _ => {
                return Err(CompileError::BadForm(
                    "lambda expects a formals list and one body expression".into(),
                ))
            }
        };
        let argn = formals.len();
        // Fresh environment so bindings made inside the body never leak
        // into the captured chain.
        let mut func = vec![Op::LoadEnv, Op::StoreEnv];
        for (i, formal) in formals.iter().enumerate() {
            let SExpr::Sym(name) = formal else {
                return Err(CompileError::BadForm("lambda formals must be symbols".into()));
            };
            func.extend([
                Op::LoadEnv,
                Op::PushFs((FRAME_OVERHEAD + argn - i) as u32),
                Op::PushS(Self::sym(name)?),
                Op::Cons,
                Op::Cons,
                Op::StoreEnv,
            ]);
        }
        self.compile_expr(body, &mut func)?;
        // Shuffle the result past the frame, then let RET reclaim the
        // leftover argument slots together with the spent lambda slot.
        if argn == 0 {
            func.extend([Op::Swap(2), Op::Swap(1), Op::Swap(0), Op::Ret(0)]);
        } else {
            func.extend([
                Op::Swap(2 + argn as u32),
                Op::Pop,
                Op::Ret(argn as u32 - 1),
            ]);
        }
        self.functions.push(func);
        out.push(Op::PushL(self.functions.len() as i64 - 1));
        Ok(())
    }

    fn compile_expr(&mut self, expr: &SExpr, out: &mut Vec<Op>) -> Result<(), CompileError> {
        match expr {
            SExpr::Int(n) => {
                out.push(Op::PushCi(*n));
                Ok(())
            }
            SExpr::Sym(name) => Self::compile_symbol(name, out),
            SExpr::List(list) => self.compile_list(list, out),
        }
    }

    fn arity(list: &[SExpr], n: usize) -> Result<(), CompileError> {
        if list.len() != n + 1 {
            return Err(CompileError::BadForm(format!(
                "{} expects {} argument(s)",
                list[0], n
            )));
        }
        Ok(())
    }

    fn compile_list(&mut self, list: &[SExpr], out: &mut Vec<Op>) -> Result<(), CompileError> {
        let Some(head) = list.first() else {
            return Ok(());
        };
        match head {
            SExpr::Int(_) => self.compile_expr(head, out),
            SExpr::List(_) => {
                // computed callee in head position
                self.compile_args(list, out)?;
                self.compile_expr(head, out)?;
                out.push(Op::Call);
                Ok(())
            }
            SExpr::Sym(name) => match name.as_str() {
                "+" | "-" | "*" | "/" | "%" | "less" | "eq" => {
                    Self::arity(list, 2)?;
                    self.compile_args(list, out)?;
                    out.push(match name.as_str() {
                        "+" => Op::Add,
                        "-" => Op::Sub,
                        "*" => Op::Mul,
                        "/" => Op::Div,
                        "%" => Op::Mod,
                        "less" => Op::Lt,
                        _ => Op::Eq,
                    });
                    Ok(())
                }
                "cons" => {
                    Self::arity(list, 2)?;
                    self.compile_expr(&list[2], out)?;
                    self.compile_expr(&list[1], out)?;
                    out.push(Op::Cons);
                    Ok(())
                }
                "car" | "cdr" => {
                    Self::arity(list, 1)?;
                    self.compile_args(list, out)?;
                    out.push(if name == "car" { Op::Car } else { Op::Cdr });
                    Ok(())
                }
                "define" => {
                    let [_, SExpr::Sym(target), value] = list else {
                        return Err(CompileError::BadForm(
                            "define expects a symbol and one expression".into(),
                        ));
                    };
                    self.compile_expr(value, out)?;
                    out.push(Op::PushS(Self::sym(target)?));
                    out.push(Op::Cons);
                    out.push(Op::Def);
                    Ok(())
                }
                "func?" => {
                    Self::arity(list, 1)?;
                    self.compile_predicate(list, Op::PushL(-1), out)
                }
                "null?" => {
                    Self::arity(list, 1)?;
                    self.compile_predicate(list, Op::PushNil, out)
                }
                "int?" => {
                    Self::arity(list, 1)?;
                    self.compile_predicate(list, Op::PushCi(0), out)
                }
                "str?" => {
                    Self::arity(list, 1)?;
                    self.compile_predicate(list, Op::PushS(Self::sym("s")?), out)
                }
                "gc" => {
                    out.push(Op::Gc);
                    out.push(Op::PushNil);
                    Ok(())
                }
                "print" => {
                    if list.len() == 1 {
                        out.push(Op::Prnl);
                    } else {
                        Self::arity(list, 1)?;
                        self.compile_expr(&list[1], out)?;
                        out.push(Op::Prn);
                    }
                    out.push(Op::PushNil);
                    Ok(())
                }
                "begin" => {
                    if list.len() < 2 {
                        return Err(CompileError::BadForm(
                            "begin expects at least one expression".into(),
                        ));
                    }
                    for expr in &list[1..list.len() - 1] {
                        self.compile_expr(expr, out)?;
                        out.push(Op::Pop);
                    }
                    self.compile_expr(&list[list.len() - 1], out)
                }
                "cond" => self.compile_cond(list, out),
                "lambda" => self.compile_lambda(list, out),
                _ => {
                    // ordinary call: arguments left to right, then the
                    // callee looked up from the environment
                    self.compile_args(list, out)?;
                    Self::compile_symbol(name, out)?;
                    out.push(Op::Call);
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sexpr::parse_forms;

    fn compile(src: &str) -> CompiledForms {
        Compiler::new()
            .compile(&parse_forms(src).unwrap())
            .unwrap()
    }

    #[test]
    fn constant_fold_scenario_program() {
        let out = compile("(+ 8 (- 10 3))");
        assert_eq!(
            out.main,
            vec![
                Op::PushCi(8),
                Op::PushCi(10),
                Op::PushCi(3),
                Op::Sub,
                Op::Add,
                Op::Fin,
            ]
        );
        assert!(out.functions.is_empty());
    }

    #[test]
    fn define_emits_name_value_pair() {
        let out = compile("(define k 10)");
        assert_eq!(
            out.main,
            vec![
                Op::PushCi(10),
                Op::PushS(Sym::new("k").unwrap()),
                Op::Cons,
                Op::Def,
                Op::Fin,
            ]
        );
    }

    #[test]
    fn symbol_reference_is_the_inline_lookup() {
        let out = compile("x");
        assert_eq!(out.main.len(), LOOKUP_LEN + 1);
        assert_eq!(out.main[0], Op::LoadEnv);
        assert_eq!(out.main[4], Op::Rjnz(6));
        assert_eq!(out.main[9], Op::Rjmp(-8));
        assert_eq!(out.main[13], Op::Swap(0));
    }

    #[test]
    fn nil_is_reserved() {
        let out = compile("Nil");
        assert_eq!(out.main, vec![Op::PushNil, Op::Fin]);
    }

    #[test]
    fn lambda_blob_shape() {
        let out = compile("(lambda (a b) (+ a b))");
        assert_eq!(out.main, vec![Op::PushL(0), Op::Fin]);
        let f = &out.functions[0];
        // env copy, two binding groups, body, epilogue
        assert_eq!(&f[0..2], &[Op::LoadEnv, Op::StoreEnv]);
        assert_eq!(f[2], Op::LoadEnv);
        assert_eq!(f[3], Op::PushFs(5));
        assert_eq!(f[4], Op::PushS(Sym::new("a").unwrap()));
        assert_eq!(f[9], Op::PushFs(4));
        let tail = &f[f.len() - 3..];
        assert_eq!(tail, &[Op::Swap(4), Op::Pop, Op::Ret(1)]);
    }

    #[test]
    fn zero_arg_lambda_epilogue_rotates_the_frame() {
        let out = compile("(lambda () 5)");
        let f = &out.functions[0];
        assert_eq!(
            &f[f.len() - 4..],
            &[Op::Swap(2), Op::Swap(1), Op::Swap(0), Op::Ret(0)]
        );
    }

    #[test]
    fn cond_branch_offsets() {
        // (cond (eq x 1) 11 (1) 99) with a one-instruction predicate
        // and result in each clause
        let out = compile("(cond 1 11 1 99)");
        assert_eq!(
            out.main,
            vec![
                Op::PushCi(1),
                Op::Rjz(4), // over POP, result, RJMP
                Op::Pop,
                Op::PushCi(11),
                Op::Rjmp(6),
                Op::Pop,
                Op::PushCi(1),
                Op::Rjz(3),
                Op::Pop,
                Op::PushCi(99),
                Op::Fin,
            ]
        );
    }

    #[test]
    fn predicates_clean_their_operands() {
        let out = compile("(null? 1)");
        assert_eq!(
            out.main,
            vec![
                Op::PushCi(1),
                Op::PushNil,
                Op::Eqt,
                Op::Swap(1),
                Op::Pop,
                Op::Pop,
                Op::Fin,
            ]
        );
    }

    #[test]
    fn func_predicate_uses_the_sentinel_closure() {
        let out = compile("(func? 1)");
        assert_eq!(out.main[1], Op::PushL(-1));
    }

    #[test]
    fn call_pushes_args_then_callee() {
        let out = compile("(f 1 2)");
        assert_eq!(out.main[0], Op::PushCi(1));
        assert_eq!(out.main[1], Op::PushCi(2));
        assert_eq!(out.main[2], Op::LoadEnv); // lookup of f
        assert_eq!(out.main[2 + LOOKUP_LEN], Op::Call);
    }

    #[test]
    fn list_head_compiles_as_computed_call() {
        let out = compile("((lambda (x) x) 1)");
        assert_eq!(
            out.main,
            vec![Op::PushCi(1), Op::PushL(0), Op::Call, Op::Fin]
        );
    }

    #[test]
    fn malformed_forms_are_rejected() {
        let forms = parse_forms("(define x)").unwrap();
        assert!(matches!(
            Compiler::new().compile(&forms),
            Err(CompileError::BadForm(_))
        ));
        let forms = parse_forms("(cond 1)").unwrap();
        assert!(matches!(
            Compiler::new().compile(&forms),
            Err(CompileError::BadForm(_))
        ));
        let forms = parse_forms("(lambda (1) 2)").unwrap();
        assert!(matches!(
            Compiler::new().compile(&forms),
            Err(CompileError::BadForm(_))
        ));
    }
}
