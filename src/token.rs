use crate::opcode::Op;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Token<'a> {
    Instruction(Op),
    /// `.name`, without the dot.
    Directive(&'a str),

    Newline,

    Colon,
    /// `&`: the address of a label.
    Ampersand,
    /// `>`: the branch offset to a label.
    Greater,

    StringLiteral(&'a str),
    Name(&'a str),

    /// Wide enough for both signed and unsigned 32-bit values.
    Number(i64),
}

impl<'a> Token<'a> {
    pub fn new(token_str: &'a str) -> Self {
        match Op::from_mnemonic(token_str) {
            Some(op) => Token::Instruction(op),
            None => Token::Name(token_str),
        }
    }
}
