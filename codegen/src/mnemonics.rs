//! The x86-64 mnemonic tables.
//!
//! Row order matters: the encoder picks the first matching row, so byte
//! forms precede the wider forms that would also accept them, and imm8
//! forms precede imm32 forms.

use crate::encoding::{
    Extension, InstructionEncoding, Mnemonic, OperandClass, OperandEncoding, OperandSize,
    OPERAND_NONE,
};

const fn op(class: OperandClass, size: OperandSize) -> OperandEncoding {
    OperandEncoding { class, size }
}

const fn r(size: OperandSize) -> OperandEncoding {
    op(OperandClass::Register, size)
}

const fn rm(size: OperandSize) -> OperandEncoding {
    op(OperandClass::RegisterMemory, size)
}

const fn mem(size: OperandSize) -> OperandEncoding {
    op(OperandClass::Memory, size)
}

const fn xmm(size: OperandSize) -> OperandEncoding {
    op(OperandClass::Xmm, size)
}

const fn xmm_mem(size: OperandSize) -> OperandEncoding {
    op(OperandClass::XmmMemory, size)
}

const fn imm(size: u8) -> OperandEncoding {
    op(OperandClass::Immediate, OperandSize::Fixed(size))
}

const fn plus_reg(size: u8) -> OperandEncoding {
    op(OperandClass::OpCodePlusRegister, OperandSize::Fixed(size))
}

const EFLAGS: OperandEncoding = op(OperandClass::Eflags, OperandSize::Any);

const ANY: OperandSize = OperandSize::Any;
const SIZE_1: OperandSize = OperandSize::Fixed(1);
const SIZE_2: OperandSize = OperandSize::Fixed(2);
const SIZE_4: OperandSize = OperandSize::Fixed(4);
const SIZE_8: OperandSize = OperandSize::Fixed(8);

const fn enc0(op_code: [u8; 4], extension: Extension) -> InstructionEncoding {
    InstructionEncoding {
        op_code,
        extension,
        operands: [OPERAND_NONE, OPERAND_NONE, OPERAND_NONE],
    }
}

const fn enc1(
    op_code: [u8; 4],
    extension: Extension,
    operand: OperandEncoding,
) -> InstructionEncoding {
    InstructionEncoding {
        op_code,
        extension,
        operands: [operand, OPERAND_NONE, OPERAND_NONE],
    }
}

const fn enc2(
    op_code: [u8; 4],
    extension: Extension,
    a: OperandEncoding,
    b: OperandEncoding,
) -> InstructionEncoding {
    InstructionEncoding {
        op_code,
        extension,
        operands: [a, b, OPERAND_NONE],
    }
}

const fn enc3(
    op_code: [u8; 4],
    extension: Extension,
    a: OperandEncoding,
    b: OperandEncoding,
    c: OperandEncoding,
) -> InstructionEncoding {
    InstructionEncoding {
        op_code,
        extension,
        operands: [a, b, c],
    }
}

pub static MOV: Mnemonic = Mnemonic {
    name: "mov",
    encodings: &[
        enc2([0, 0, 0, 0x88], Extension::Register, rm(SIZE_1), r(SIZE_1)),
        enc2([0, 0, 0, 0x89], Extension::Register, rm(ANY), r(ANY)),
        enc2([0, 0, 0, 0x8A], Extension::Register, r(SIZE_1), rm(SIZE_1)),
        enc2([0, 0, 0, 0x8B], Extension::Register, r(ANY), rm(ANY)),
        enc2([0, 0, 0, 0xC6], Extension::OpCode(0), rm(SIZE_1), imm(1)),
        enc2([0, 0, 0, 0xC7], Extension::OpCode(0), rm(SIZE_2), imm(2)),
        enc2([0, 0, 0, 0xC7], Extension::OpCode(0), rm(ANY), imm(4)),
        enc2(
            [0, 0, 0, 0xB8],
            Extension::PlusRegister,
            plus_reg(8),
            imm(8),
        ),
    ],
};

pub static MOVSX: Mnemonic = Mnemonic {
    name: "movsx",
    encodings: &[
        enc2([0, 0, 0x0F, 0xBE], Extension::Register, r(ANY), rm(SIZE_1)),
        enc2([0, 0, 0x0F, 0xBF], Extension::Register, r(ANY), rm(SIZE_2)),
        enc2([0, 0, 0, 0x63], Extension::Register, r(SIZE_8), rm(SIZE_4)),
    ],
};

pub static LEA: Mnemonic = Mnemonic {
    name: "lea",
    encodings: &[enc2(
        [0, 0, 0, 0x8D],
        Extension::Register,
        r(SIZE_8),
        mem(ANY),
    )],
};

pub static ADD: Mnemonic = Mnemonic {
    name: "add",
    encodings: &[
        enc2([0, 0, 0, 0x00], Extension::Register, rm(SIZE_1), r(SIZE_1)),
        enc2([0, 0, 0, 0x01], Extension::Register, rm(ANY), r(ANY)),
        enc2([0, 0, 0, 0x02], Extension::Register, r(SIZE_1), rm(SIZE_1)),
        enc2([0, 0, 0, 0x03], Extension::Register, r(ANY), rm(ANY)),
        enc2([0, 0, 0, 0x80], Extension::OpCode(0), rm(SIZE_1), imm(1)),
        enc2([0, 0, 0, 0x83], Extension::OpCode(0), rm(ANY), imm(1)),
        enc2([0, 0, 0, 0x81], Extension::OpCode(0), rm(ANY), imm(4)),
    ],
};

pub static SUB: Mnemonic = Mnemonic {
    name: "sub",
    encodings: &[
        enc2([0, 0, 0, 0x28], Extension::Register, rm(SIZE_1), r(SIZE_1)),
        enc2([0, 0, 0, 0x29], Extension::Register, rm(ANY), r(ANY)),
        enc2([0, 0, 0, 0x2A], Extension::Register, r(SIZE_1), rm(SIZE_1)),
        enc2([0, 0, 0, 0x2B], Extension::Register, r(ANY), rm(ANY)),
        enc2([0, 0, 0, 0x80], Extension::OpCode(5), rm(SIZE_1), imm(1)),
        enc2([0, 0, 0, 0x83], Extension::OpCode(5), rm(ANY), imm(1)),
        enc2([0, 0, 0, 0x81], Extension::OpCode(5), rm(ANY), imm(4)),
    ],
};

pub static XOR: Mnemonic = Mnemonic {
    name: "xor",
    encodings: &[
        enc2([0, 0, 0, 0x30], Extension::Register, rm(SIZE_1), r(SIZE_1)),
        enc2([0, 0, 0, 0x31], Extension::Register, rm(ANY), r(ANY)),
        enc2([0, 0, 0, 0x32], Extension::Register, r(SIZE_1), rm(SIZE_1)),
        enc2([0, 0, 0, 0x33], Extension::Register, r(ANY), rm(ANY)),
        enc2([0, 0, 0, 0x80], Extension::OpCode(6), rm(SIZE_1), imm(1)),
        enc2([0, 0, 0, 0x83], Extension::OpCode(6), rm(ANY), imm(1)),
        enc2([0, 0, 0, 0x81], Extension::OpCode(6), rm(ANY), imm(4)),
    ],
};

pub static CMP: Mnemonic = Mnemonic {
    name: "cmp",
    encodings: &[
        enc2([0, 0, 0, 0x38], Extension::Register, rm(SIZE_1), r(SIZE_1)),
        enc2([0, 0, 0, 0x39], Extension::Register, rm(ANY), r(ANY)),
        enc2([0, 0, 0, 0x3A], Extension::Register, r(SIZE_1), rm(SIZE_1)),
        enc2([0, 0, 0, 0x3B], Extension::Register, r(ANY), rm(ANY)),
        enc2([0, 0, 0, 0x80], Extension::OpCode(7), rm(SIZE_1), imm(1)),
        enc2([0, 0, 0, 0x83], Extension::OpCode(7), rm(ANY), imm(1)),
        enc2([0, 0, 0, 0x81], Extension::OpCode(7), rm(ANY), imm(4)),
    ],
};

pub static IMUL: Mnemonic = Mnemonic {
    name: "imul",
    encodings: &[
        enc2([0, 0, 0x0F, 0xAF], Extension::Register, r(ANY), rm(ANY)),
        enc3(
            [0, 0, 0, 0x6B],
            Extension::Register,
            r(ANY),
            rm(ANY),
            imm(1),
        ),
        enc3(
            [0, 0, 0, 0x69],
            Extension::Register,
            r(ANY),
            rm(ANY),
            imm(4),
        ),
    ],
};

pub static IDIV: Mnemonic = Mnemonic {
    name: "idiv",
    encodings: &[
        enc1([0, 0, 0, 0xF6], Extension::OpCode(7), rm(SIZE_1)),
        enc1([0, 0, 0, 0xF7], Extension::OpCode(7), rm(ANY)),
    ],
};

// The sign-extension family shares opcode 0x99/0x98; the operand size the
// hardware keys on is baked into the table as prefix bytes because these
// instructions carry no explicit operands.
pub static CQO: Mnemonic = Mnemonic {
    name: "cqo",
    encodings: &[enc0([0, 0, 0x48, 0x99], Extension::None)],
};

pub static CDQ: Mnemonic = Mnemonic {
    name: "cdq",
    encodings: &[enc0([0, 0, 0, 0x99], Extension::None)],
};

pub static CWD: Mnemonic = Mnemonic {
    name: "cwd",
    encodings: &[enc0([0, 0, 0x66, 0x99], Extension::None)],
};

pub static CBW: Mnemonic = Mnemonic {
    name: "cbw",
    encodings: &[enc0([0, 0, 0x66, 0x98], Extension::None)],
};

pub static CALL: Mnemonic = Mnemonic {
    name: "call",
    encodings: &[
        enc1([0, 0, 0, 0xE8], Extension::None, imm(4)),
        enc1([0, 0, 0, 0xFF], Extension::OpCode(2), rm(SIZE_8)),
    ],
};

pub static RET: Mnemonic = Mnemonic {
    name: "ret",
    encodings: &[enc0([0, 0, 0, 0xC3], Extension::None)],
};

pub static INT3: Mnemonic = Mnemonic {
    name: "int3",
    encodings: &[enc0([0, 0, 0, 0xCC], Extension::None)],
};

pub static SYSCALL: Mnemonic = Mnemonic {
    name: "syscall",
    encodings: &[enc0([0, 0, 0x0F, 0x05], Extension::None)],
};

pub static REP_MOVSB: Mnemonic = Mnemonic {
    name: "rep movsb",
    encodings: &[enc0([0, 0, 0xF3, 0xA4], Extension::None)],
};

pub static PUSH: Mnemonic = Mnemonic {
    name: "push",
    encodings: &[
        enc1([0, 0, 0, 0x50], Extension::PlusRegister, plus_reg(8)),
        enc1([0, 0, 0, 0xFF], Extension::OpCode(6), rm(SIZE_8)),
        enc1([0, 0, 0, 0x68], Extension::None, imm(4)),
    ],
};

pub static POP: Mnemonic = Mnemonic {
    name: "pop",
    encodings: &[
        enc1([0, 0, 0, 0x58], Extension::PlusRegister, plus_reg(8)),
        enc1([0, 0, 0, 0x8F], Extension::OpCode(0), rm(SIZE_8)),
    ],
};

pub static JMP: Mnemonic = Mnemonic {
    name: "jmp",
    encodings: &[
        enc1([0, 0, 0, 0xEB], Extension::None, imm(1)),
        enc1([0, 0, 0, 0xE9], Extension::None, imm(4)),
        enc1([0, 0, 0, 0xFF], Extension::OpCode(4), rm(SIZE_8)),
    ],
};

macro_rules! jcc {
    ($name:ident, $text:expr, $short:expr, $near:expr) => {
        pub static $name: Mnemonic = Mnemonic {
            name: $text,
            encodings: &[
                enc2([0, 0, 0, $short], Extension::None, imm(1), EFLAGS),
                enc2([0, 0, 0x0F, $near], Extension::None, imm(4), EFLAGS),
            ],
        };
    };
}

jcc!(JE, "je", 0x74, 0x84);
jcc!(JNE, "jne", 0x75, 0x85);
jcc!(JB, "jb", 0x72, 0x82);
jcc!(JAE, "jae", 0x73, 0x83);
jcc!(JBE, "jbe", 0x76, 0x86);
jcc!(JA, "ja", 0x77, 0x87);
jcc!(JL, "jl", 0x7C, 0x8C);
jcc!(JGE, "jge", 0x7D, 0x8D);
jcc!(JLE, "jle", 0x7E, 0x8E);
jcc!(JG, "jg", 0x7F, 0x8F);

macro_rules! setcc {
    ($name:ident, $text:expr, $opcode:expr) => {
        pub static $name: Mnemonic = Mnemonic {
            name: $text,
            encodings: &[enc2(
                [0, 0, 0x0F, $opcode],
                Extension::OpCode(0),
                rm(SIZE_1),
                EFLAGS,
            )],
        };
    };
}

setcc!(SETE, "sete", 0x94);
setcc!(SETNE, "setne", 0x95);
setcc!(SETB, "setb", 0x92);
setcc!(SETAE, "setae", 0x93);
setcc!(SETBE, "setbe", 0x96);
setcc!(SETA, "seta", 0x97);
setcc!(SETL, "setl", 0x9C);
setcc!(SETGE, "setge", 0x9D);
setcc!(SETLE, "setle", 0x9E);
setcc!(SETG, "setg", 0x9F);

pub static MOVSS: Mnemonic = Mnemonic {
    name: "movss",
    encodings: &[
        enc2(
            [0, 0xF3, 0x0F, 0x10],
            Extension::Register,
            xmm(SIZE_4),
            xmm_mem(SIZE_4),
        ),
        enc2(
            [0, 0xF3, 0x0F, 0x11],
            Extension::Register,
            xmm_mem(SIZE_4),
            xmm(SIZE_4),
        ),
    ],
};

pub static MOVSD: Mnemonic = Mnemonic {
    name: "movsd",
    encodings: &[
        enc2(
            [0, 0xF2, 0x0F, 0x10],
            Extension::Register,
            xmm(SIZE_8),
            xmm_mem(SIZE_8),
        ),
        enc2(
            [0, 0xF2, 0x0F, 0x11],
            Extension::Register,
            xmm_mem(SIZE_8),
            xmm(SIZE_8),
        ),
    ],
};

/// The conditional-jump mnemonic that branches when the comparison holds.
pub fn jcc_for_compare(compare_type: crate::storage::CompareType) -> &'static Mnemonic {
    use crate::storage::CompareType::*;
    match compare_type {
        Equal => &JE,
        NotEqual => &JNE,
        UnsignedBelow => &JB,
        UnsignedBelowEqual => &JBE,
        UnsignedAbove => &JA,
        UnsignedAboveEqual => &JAE,
        SignedLess => &JL,
        SignedLessEqual => &JLE,
        SignedGreater => &JG,
        SignedGreaterEqual => &JGE,
    }
}

/// The `setcc` mnemonic that materializes the comparison as 0 or 1.
pub fn setcc_for_compare(compare_type: crate::storage::CompareType) -> &'static Mnemonic {
    use crate::storage::CompareType::*;
    match compare_type {
        Equal => &SETE,
        NotEqual => &SETNE,
        UnsignedBelow => &SETB,
        UnsignedBelowEqual => &SETBE,
        UnsignedAbove => &SETA,
        UnsignedAboveEqual => &SETAE,
        SignedLess => &SETL,
        SignedLessEqual => &SETLE,
        SignedGreater => &SETG,
        SignedGreaterEqual => &SETGE,
    }
}
