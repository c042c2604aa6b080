//! The bytecode instruction set and its line-oriented text format.
//!
//! The text format is the external contract between the compiler and
//! the VM: one uppercase mnemonic per line, a single space before the
//! immediate when there is one. Instructions are predecoded into the
//! [`Op`] enum at load time; dispatch never re-parses text.

use std::fmt;
use std::str::FromStr;

use crate::cell::Sym;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Push a literal integer.
    PushCi(i64),
    /// Push a literal symbol.
    PushS(Sym),
    /// Push Nil.
    PushNil,
    /// Push a closure over the current environment. `-1` is the inert
    /// sentinel closure used by type-check idioms; before linking the
    /// operand is a function-table index, after linking an absolute pc.
    PushL(i64),
    /// Copy the stack slot `k` below the top to the top.
    PushFs(u32),
    /// Push the frame slot `fp + k` (`k <= 0`); emitted only by the
    /// argument-elision pass.
    PushFp(i32),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// Signed less-than on the two topmost integers.
    Lt,
    /// Value equality; mixed tags are a type error.
    Eq,
    /// Tag-only equality; keeps both operands and pushes the flag.
    Eqt,
    /// Compare the string on top against an immediate symbol; keeps the
    /// operand and pushes the flag.
    Eqsi(Sym),
    /// Migrate two cells to the heap and push the pair.
    Cons,
    Car,
    Cdr,
    /// Like `CAR`/`CDR` but keeping the pair on the stack.
    PushCar,
    PushCdr,
    /// Prepend the `(name . value)` pair on top to the current
    /// environment, leaving the name.
    Def,
    /// Push the current environment pair as a value.
    LoadEnv,
    /// Migrate the top of stack to the heap and make it the current
    /// environment.
    StoreEnv,
    /// Relative jump, measured in instructions.
    Rjmp(i32),
    /// Relative jump when the integer on top is zero (top is kept).
    Rjz(i32),
    /// Relative jump when the integer on top is non-zero (top is kept).
    Rjnz(i32),
    Call,
    /// Return from a call, dropping `n` leftover argument slots.
    Ret(u32),
    /// Print the popped value.
    Prn,
    /// Print a newline.
    Prnl,
    /// Force a collection.
    Gc,
    /// Halt.
    Fin,
    Pop,
    /// Exchange the top of stack with the slot `k` below it.
    Swap(u32),
    Nop,
    /// A mnemonic this VM does not know. Kept so that the lenient /
    /// strict choice stays a run-time policy.
    Unknown(Box<str>),
}

impl Op {
    pub fn mnemonic(&self) -> &str {
        match self {
            Self::PushCi(_) => "PUSHCI",
            Self::PushS(_) => "PUSHS",
            Self::PushNil => "PUSHNIL",
            Self::PushL(_) => "PUSHL",
            Self::PushFs(_) => "PUSHFS",
            Self::PushFp(_) => "PUSHFP",
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Div => "DIV",
            Self::Mod => "MOD",
            Self::Lt => "LT",
            Self::Eq => "EQ",
            Self::Eqt => "EQT",
            Self::Eqsi(_) => "EQSI",
            Self::Cons => "CONS",
            Self::Car => "CAR",
            Self::Cdr => "CDR",
            Self::PushCar => "PUSHCAR",
            Self::PushCdr => "PUSHCDR",
            Self::Def => "DEF",
            Self::LoadEnv => "LOADENV",
            Self::StoreEnv => "STOREENV",
            Self::Rjmp(_) => "RJMP",
            Self::Rjz(_) => "RJZ",
            Self::Rjnz(_) => "RJNZ",
            Self::Call => "CALL",
            Self::Ret(_) => "RET",
            Self::Prn => "PRN",
            Self::Prnl => "PRNL",
            Self::Gc => "GC",
            Self::Fin => "FIN",
            Self::Pop => "POP",
            Self::Swap(_) => "SWAP",
            Self::Nop => "NOP",
            Self::Unknown(m) => m,
        }
    }

    /// The relative offset of a branch instruction.
    #[inline]
    pub fn branch_offset(&self) -> Option<i32> {
        match self {
            Self::Rjmp(d) | Self::Rjz(d) | Self::Rjnz(d) => Some(*d),
            _ => None,
        }
    }

    /// The same branch with a different offset.
    pub fn with_branch_offset(&self, d: i32) -> Op {
        match self {
            Self::Rjmp(_) => Self::Rjmp(d),
            Self::Rjz(_) => Self::Rjz(d),
            Self::Rjnz(_) => Self::Rjnz(d),
            other => other.clone(),
        }
    }

    /// Whether this opcode may allocate heap cells (and therefore runs
    /// the collection guard first).
    #[inline]
    pub fn allocates(&self) -> bool {
        matches!(self, Self::Cons | Self::Def | Self::StoreEnv)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushCi(n) => write!(f, "PUSHCI {n}"),
            Self::PushS(s) => write!(f, "PUSHS {s}"),
            Self::PushL(k) => write!(f, "PUSHL {k}"),
            Self::PushFs(k) => write!(f, "PUSHFS {k}"),
            Self::PushFp(k) => write!(f, "PUSHFP {k}"),
            Self::Eqsi(s) => write!(f, "EQSI {s}"),
            Self::Rjmp(d) => write!(f, "RJMP {d:+}"),
            Self::Rjz(d) => write!(f, "RJZ {d:+}"),
            Self::Rjnz(d) => write!(f, "RJNZ {d:+}"),
            Self::Ret(n) => write!(f, "RET {n}"),
            Self::Swap(k) => write!(f, "SWAP {k}"),
            other => f.write_str(other.mnemonic()),
        }
    }
}

/// Why a bytecode line failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The mnemonic requires an immediate and none was given, or the
    /// immediate does not parse.
    BadOperand { mnemonic: String, operand: String },
    /// A symbol immediate longer than the 7-byte field allows.
    LongSymbol(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadOperand { mnemonic, operand } => {
                write!(f, "bad operand for {mnemonic}: {operand:?}")
            }
            Self::LongSymbol(s) => write!(f, "long names are not supported: {s}"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn int_operand<T: FromStr>(mnemonic: &str, operand: Option<&str>) -> Result<T, DecodeError> {
    let text = operand.unwrap_or("");
    // `+6` style offsets: strip the explicit plus sign.
    text.strip_prefix('+')
        .unwrap_or(text)
        .parse()
        .map_err(|_| DecodeError::BadOperand {
            mnemonic: mnemonic.to_string(),
            operand: text.to_string(),
        })
}

fn sym_operand(mnemonic: &str, operand: Option<&str>) -> Result<Sym, DecodeError> {
    let text = operand.ok_or_else(|| DecodeError::BadOperand {
        mnemonic: mnemonic.to_string(),
        operand: String::new(),
    })?;
    Sym::new(text).map_err(|e| DecodeError::LongSymbol(e.0))
}

impl FromStr for Op {
    type Err = DecodeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(mnemonic) = parts.next() else {
            return Ok(Op::Nop);
        };
        let operand = parts.next();
        let op = match mnemonic {
            "PUSHCI" => Op::PushCi(int_operand(mnemonic, operand)?),
            "PUSHS" => Op::PushS(sym_operand(mnemonic, operand)?),
            "PUSHNIL" => Op::PushNil,
            "PUSHL" => Op::PushL(int_operand(mnemonic, operand)?),
            "PUSHFS" => Op::PushFs(int_operand(mnemonic, operand)?),
            "PUSHFP" => Op::PushFp(int_operand(mnemonic, operand)?),
            "ADD" => Op::Add,
            "SUB" => Op::Sub,
            "MUL" => Op::Mul,
            "DIV" => Op::Div,
            "MOD" => Op::Mod,
            "LT" => Op::Lt,
            "EQ" => Op::Eq,
            "EQT" => Op::Eqt,
            "EQSI" => Op::Eqsi(sym_operand(mnemonic, operand)?),
            "CONS" => Op::Cons,
            "CAR" => Op::Car,
            "CDR" => Op::Cdr,
            "PUSHCAR" => Op::PushCar,
            "PUSHCDR" => Op::PushCdr,
            "DEF" => Op::Def,
            "LOADENV" => Op::LoadEnv,
            "STOREENV" => Op::StoreEnv,
            "RJMP" => Op::Rjmp(int_operand(mnemonic, operand)?),
            "RJZ" => Op::Rjz(int_operand(mnemonic, operand)?),
            "RJNZ" => Op::Rjnz(int_operand(mnemonic, operand)?),
            "CALL" => Op::Call,
            "RET" => Op::Ret(int_operand(mnemonic, operand)?),
            "PRN" => Op::Prn,
            "PRNL" => Op::Prnl,
            "GC" => Op::Gc,
            "FIN" => Op::Fin,
            "POP" => Op::Pop,
            "SWAP" => Op::Swap(int_operand(mnemonic, operand)?),
            "NOP" => Op::Nop,
            other => Op::Unknown(other.into()),
        };
        Ok(op)
    }
}

/// A decoded instruction stream, addressed by pc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    ops: Vec<Op>,
}

/// A decode failure with its 1-based source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramError {
    pub line: usize,
    pub error: DecodeError,
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.error)
    }
}

impl std::error::Error for ProgramError {}

impl Program {
    pub fn new(ops: Vec<Op>) -> Self {
        Program { ops }
    }

    /// Decode bytecode text, one instruction per line. Blank lines
    /// decode to `NOP` so line numbers stay addressable.
    pub fn parse(text: &str) -> Result<Self, ProgramError> {
        let mut ops = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let op = line.parse().map_err(|error| ProgramError {
                line: i + 1,
                error,
            })?;
            ops.push(op);
        }
        Ok(Program { ops })
    }

    #[inline]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[inline]
    pub fn get(&self, pc: usize) -> Option<&Op> {
        self.ops.get(pc)
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.ops {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_text() {
        let ops = vec![
            Op::PushCi(-7),
            Op::PushS(Sym::new("fact").unwrap()),
            Op::PushNil,
            Op::PushL(-1),
            Op::PushFs(4),
            Op::PushFp(-2),
            Op::Eqsi(Sym::new("n").unwrap()),
            Op::Rjnz(6),
            Op::Rjmp(-8),
            Op::Ret(2),
            Op::Swap(0),
            Op::Call,
            Op::Fin,
        ];
        let text = Program::new(ops.clone()).to_string();
        let back = Program::parse(&text).unwrap();
        assert_eq!(back.ops(), &ops[..]);
    }

    #[test]
    fn branch_offsets_accept_explicit_plus() {
        assert_eq!("RJNZ +6".parse::<Op>().unwrap(), Op::Rjnz(6));
        assert_eq!("RJMP -8".parse::<Op>().unwrap(), Op::Rjmp(-8));
        assert_eq!("RJZ 5".parse::<Op>().unwrap(), Op::Rjz(5));
    }

    #[test]
    fn unknown_mnemonics_survive_decoding() {
        let op = "FROB 12".parse::<Op>().unwrap();
        assert_eq!(op, Op::Unknown("FROB".into()));
    }

    #[test]
    fn malformed_immediates_are_rejected() {
        assert!(matches!(
            "PUSHCI xyz".parse::<Op>(),
            Err(DecodeError::BadOperand { .. })
        ));
        assert!(matches!(
            "RJZ".parse::<Op>(),
            Err(DecodeError::BadOperand { .. })
        ));
        assert!(matches!(
            "PUSHS abcdefgh".parse::<Op>(),
            Err(DecodeError::LongSymbol(_))
        ));
    }

    #[test]
    fn blank_lines_decode_to_nop() {
        let p = Program::parse("PUSHCI 1\n\nFIN\n").unwrap();
        assert_eq!(p.ops(), &[Op::PushCi(1), Op::Nop, Op::Fin]);
    }

    #[test]
    fn branch_helpers() {
        assert_eq!(Op::Rjz(3).branch_offset(), Some(3));
        assert_eq!(Op::Pop.branch_offset(), None);
        assert_eq!(Op::Rjnz(6).with_branch_offset(4), Op::Rjnz(4));
        assert!(Op::Cons.allocates());
        assert!(Op::Def.allocates());
        assert!(Op::StoreEnv.allocates());
        assert!(!Op::Pop.allocates());
    }
}
