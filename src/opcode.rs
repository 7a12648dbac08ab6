//! Opcode numbers, assembler mnemonics and operand signatures.
//!
//! Operand forms: `L` loads a value, `S` stores one, `C` names the
//! destination of a call stub.

macro_rules! opcodes {
    ($($name:ident = $code:literal, $mnemonic:literal, $forms:literal;)*) => {
        /// Every opcode the engine executes.
        #[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
        pub enum Op {
            $($name,)*
        }

        impl Op {
            pub fn from_code(code: u32) -> Option<Op> {
                match code {
                    $($code => Some(Op::$name),)*
                    _ => None,
                }
            }

            pub fn code(self) -> u32 {
                match self {
                    $(Op::$name => $code,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Op::$name => $mnemonic,)*
                }
            }

            pub fn from_mnemonic(mnemonic: &str) -> Option<Op> {
                match mnemonic {
                    $($mnemonic => Some(Op::$name),)*
                    _ => None,
                }
            }

            /// Operand signature, one form letter per operand.
            pub fn forms(self) -> &'static [u8] {
                match self {
                    $(Op::$name => $forms.as_bytes(),)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", "";
    Add = 0x10, "add", "LLS";
    Sub = 0x11, "sub", "LLS";
    Mul = 0x12, "mul", "LLS";
    Div = 0x13, "div", "LLS";
    Mod = 0x14, "mod", "LLS";
    Neg = 0x15, "neg", "LS";
    BitAnd = 0x18, "bitand", "LLS";
    BitOr = 0x19, "bitor", "LLS";
    BitXor = 0x1A, "bitxor", "LLS";
    BitNot = 0x1B, "bitnot", "LS";
    ShiftL = 0x1C, "shiftl", "LLS";
    SShiftR = 0x1D, "sshiftr", "LLS";
    UShiftR = 0x1E, "ushiftr", "LLS";
    Jump = 0x20, "jump", "L";
    Jz = 0x22, "jz", "LL";
    Jnz = 0x23, "jnz", "LL";
    Jeq = 0x24, "jeq", "LLL";
    Jne = 0x25, "jne", "LLL";
    Jlt = 0x26, "jlt", "LLL";
    Jge = 0x27, "jge", "LLL";
    Jgt = 0x28, "jgt", "LLL";
    Jle = 0x29, "jle", "LLL";
    Jltu = 0x2A, "jltu", "LLL";
    Jgeu = 0x2B, "jgeu", "LLL";
    Jgtu = 0x2C, "jgtu", "LLL";
    Jleu = 0x2D, "jleu", "LLL";
    Call = 0x30, "call", "LLC";
    Return = 0x31, "return", "L";
    Catch = 0x32, "catch", "CL";
    Throw = 0x33, "throw", "LL";
    TailCall = 0x34, "tailcall", "LL";
    Copy = 0x40, "copy", "LS";
    CopyS = 0x41, "copys", "LS";
    CopyB = 0x42, "copyb", "LS";
    Sexs = 0x44, "sexs", "LS";
    Sexb = 0x45, "sexb", "LS";
    ALoad = 0x48, "aload", "LLS";
    ALoadS = 0x49, "aloads", "LLS";
    ALoadB = 0x4A, "aloadb", "LLS";
    ALoadBit = 0x4B, "aloadbit", "LLS";
    AStore = 0x4C, "astore", "LLL";
    AStoreS = 0x4D, "astores", "LLL";
    AStoreB = 0x4E, "astoreb", "LLL";
    AStoreBit = 0x4F, "astorebit", "LLL";
    StkCount = 0x50, "stkcount", "S";
    StkPeek = 0x51, "stkpeek", "LS";
    StkSwap = 0x52, "stkswap", "";
    StkRoll = 0x53, "stkroll", "LL";
    StkCopy = 0x54, "stkcopy", "L";
    StreamChar = 0x70, "streamchar", "L";
    StreamNum = 0x71, "streamnum", "L";
    StreamStr = 0x72, "streamstr", "L";
    StreamUniChar = 0x73, "streamunichar", "L";
    Gestalt = 0x100, "gestalt", "LLS";
    DebugTrap = 0x101, "debugtrap", "L";
    GetMemSize = 0x102, "getmemsize", "S";
    SetMemSize = 0x103, "setmemsize", "LS";
    JumpAbs = 0x104, "jumpabs", "L";
    Random = 0x110, "random", "LS";
    SetRandom = 0x111, "setrandom", "L";
    Quit = 0x120, "quit", "";
    Verify = 0x121, "verify", "S";
    Restart = 0x122, "restart", "";
    Save = 0x123, "save", "LC";
    Restore = 0x124, "restore", "LS";
    SaveUndo = 0x125, "saveundo", "C";
    RestoreUndo = 0x126, "restoreundo", "S";
    Protect = 0x127, "protect", "LL";
    Glk = 0x130, "glk", "LLS";
    GetStringTbl = 0x140, "getstringtbl", "S";
    SetStringTbl = 0x141, "setstringtbl", "L";
    GetIosys = 0x148, "getiosys", "SS";
    SetIosys = 0x149, "setiosys", "LL";
    LinearSearch = 0x150, "linearsearch", "LLLLLLLS";
    BinarySearch = 0x151, "binarysearch", "LLLLLLLS";
    LinkedSearch = 0x152, "linkedsearch", "LLLLLLS";
    CallF = 0x160, "callf", "LC";
    CallFI = 0x161, "callfi", "LLC";
    CallFII = 0x162, "callfii", "LLLC";
    CallFIII = 0x163, "callfiii", "LLLLC";
    MZero = 0x170, "mzero", "LL";
    MCopy = 0x171, "mcopy", "LLL";
    Malloc = 0x178, "malloc", "LS";
    MFree = 0x179, "mfree", "L";
    AccelFunc = 0x180, "accelfunc", "LL";
    AccelParam = 0x181, "accelparam", "LL";
    NumToF = 0x190, "numtof", "LS";
    FToNumZ = 0x191, "ftonumz", "LS";
    FToNumN = 0x192, "ftonumn", "LS";
    Ceil = 0x198, "ceil", "LS";
    Floor = 0x199, "floor", "LS";
    FAdd = 0x1A0, "fadd", "LLS";
    FSub = 0x1A1, "fsub", "LLS";
    FMul = 0x1A2, "fmul", "LLS";
    FDiv = 0x1A3, "fdiv", "LLS";
    FMod = 0x1A4, "fmod", "LLSS";
    Sqrt = 0x1A8, "sqrt", "LS";
    Exp = 0x1A9, "exp", "LS";
    Log = 0x1AA, "log", "LS";
    Pow = 0x1AB, "pow", "LLS";
    Sin = 0x1B0, "sin", "LS";
    Cos = 0x1B1, "cos", "LS";
    Tan = 0x1B2, "tan", "LS";
    ASin = 0x1B3, "asin", "LS";
    ACos = 0x1B4, "acos", "LS";
    ATan = 0x1B5, "atan", "LS";
    ATan2 = 0x1B6, "atan2", "LLS";
    JFeq = 0x1C0, "jfeq", "LLLL";
    JFne = 0x1C1, "jfne", "LLLL";
    JFlt = 0x1C2, "jflt", "LLL";
    JFle = 0x1C3, "jfle", "LLL";
    JFgt = 0x1C4, "jfgt", "LLL";
    JFge = 0x1C5, "jfge", "LLL";
    JIsNaN = 0x1C8, "jisnan", "LL";
    JIsInf = 0x1C9, "jisinf", "LL";
}

impl Op {
    /// Width in bytes of memory and local operands.
    pub fn arg_size(self) -> u32 {
        match self {
            Op::CopyS => 2,
            Op::CopyB => 1,
            _ => 4,
        }
    }

    /// Whether the last operand is a branch offset.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Op::Jump
                | Op::Jz
                | Op::Jnz
                | Op::Jeq
                | Op::Jne
                | Op::Jlt
                | Op::Jge
                | Op::Jgt
                | Op::Jle
                | Op::Jltu
                | Op::Jgeu
                | Op::Jgtu
                | Op::Jleu
                | Op::JFeq
                | Op::JFne
                | Op::JFlt
                | Op::JFle
                | Op::JFgt
                | Op::JFge
                | Op::JIsNaN
                | Op::JIsInf
        )
    }

    /// Whether execution never falls through to the next instruction
    /// within the same decoded path.
    pub fn ends_path(self) -> bool {
        matches!(
            self,
            Op::Jump
                | Op::JumpAbs
                | Op::Call
                | Op::Return
                | Op::Catch
                | Op::Throw
                | Op::TailCall
                | Op::CallF
                | Op::CallFI
                | Op::CallFII
                | Op::CallFIII
                | Op::StreamStr
                | Op::Quit
                | Op::Restart
                | Op::Save
                | Op::Restore
                | Op::SaveUndo
                | Op::RestoreUndo
                | Op::Glk
                | Op::SetIosys
        )
    }

    /// Output opcodes that call the filter function in filter mode.
    pub fn is_filtered_output(self) -> bool {
        matches!(
            self,
            Op::StreamChar | Op::StreamNum | Op::StreamUniChar
        )
    }
}
