use super::token::Token;
use anyhow::{anyhow, bail};
use std::str;

pub struct Lexer<'a> {
    program: &'a str,
    cursor: usize,
}

type LResult<'a> = anyhow::Result<Option<Token<'a>>>;

impl<'a> Lexer<'a> {
    pub fn new(program: &'a str) -> Self {
        Lexer { program, cursor: 0 }
    }

    /// Get the next token. This consumes the tokens.
    pub fn next_token(&mut self) -> LResult<'a> {
        self.trim();

        match self.next_char(false) {
            Some(b'\'') => self.read_str_literal(),
            Some(b':') => Ok(Some(Token::Colon)),
            Some(b'&') => Ok(Some(Token::Ampersand)),
            Some(b'>') => Ok(Some(Token::Greater)),
            Some(b'\n') => Ok(Some(Token::Newline)),
            Some(b'.') => self.read_directive(),
            Some(ch) => {
                if ch.is_ascii_digit() || ch == b'-' {
                    self.read_number()
                } else if ch.is_ascii_alphabetic() || ch == b'_' {
                    self.read_token()
                } else {
                    Err(anyhow!("Unexpected character '{}'.", ch as char))
                }
            }

            None => Ok(None),
        }
    }

    /// Trim whitespaces, tabs, carriage returns, control chars and comments
    fn trim(&mut self) {
        while let Some(ch) = self.next_char(true) {
            if ch == b';' {
                while let Some(ch) = self.next_char(true) {
                    if ch == b'\n' {
                        break;
                    }
                    self.cursor += 1;
                }
                break;
            }
            if ch != b'\t' && ch != b'\r' && ch != b'\x0C' && ch != b' ' {
                break;
            }
            self.cursor += 1;
        }
    }

    /// Read a decimal or `0x` hexadecimal number, optionally negative
    fn read_number(&mut self) -> LResult<'a> {
        let start_pos = self.cursor - 1;
        while let Some(ch) = self.next_char(false) {
            if !ch.is_ascii_alphanumeric() {
                self.cursor -= 1;
                break;
            }
        }

        let text = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor])?;
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        if digits.is_empty() {
            bail!("Expected a number after '-'.");
        }
        let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            Some(hex) => i64::from_str_radix(hex, 16)?,
            None => digits.parse::<i64>()?,
        };

        Ok(Some(Token::Number(if negative { -value } else { value })))
    }

    /// Read a string literal that starts and ends with "'"
    fn read_str_literal(&mut self) -> LResult<'a> {
        let mut finished = false;
        let start_pos = self.cursor;
        while let Some(ch) = self.next_char(false) {
            if ch == b'\n' {
                // Strings cannot continue from next line
                break;
            } else if ch == b'\'' {
                finished = true;
                break;
            }
        }

        if !finished {
            Err(anyhow!("String literal is not finished properly."))
        } else {
            let str_lit = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor - 1])?;
            Ok(Some(Token::StringLiteral(str_lit)))
        }
    }

    /// Read a directive name after the '.'
    fn read_directive(&mut self) -> LResult<'a> {
        let start_pos = self.cursor;
        while let Some(ch) = self.next_char(true) {
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                break;
            }
            self.cursor += 1;
        }
        if start_pos == self.cursor {
            bail!("Expected a directive name after '.'.");
        }

        let name = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor])?;
        Ok(Some(Token::Directive(name)))
    }

    /// Read any other token
    fn read_token(&mut self) -> LResult<'a> {
        let start_pos = self.cursor - 1;
        while let Some(ch) = self.next_char(false) {
            // Only alphanumberic characters and '_'
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                self.cursor -= 1;
                break;
            }
        }

        let token_str = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor])?;
        Ok(Some(Token::new(token_str)))
    }

    /// Get the next char and increase the cursor if `peek` is false
    fn next_char(&mut self, peek: bool) -> Option<u8> {
        if let Some(ch) = self.program.as_bytes().get(self.cursor) {
            if !peek {
                self.cursor += 1;
            }
            Some(*ch)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Op;

    #[test]
    fn trim() {
        let program = "\t\r\x0C streamstr &hello";
        let mut lexer = Lexer::new(program);
        lexer.trim();
        assert_eq!(&lexer.program[lexer.cursor..], "streamstr &hello");

        let mut lexer = Lexer::new("  ; a comment\nnop");
        lexer.trim();
        assert_eq!(&lexer.program[lexer.cursor..], "\nnop");
    }

    #[test]
    fn read_str_literal() {
        let program = "'test_00_me'";
        let mut lexer = Lexer::new(program);
        let _ = lexer.next_char(false);
        let token = lexer.read_str_literal().unwrap();
        assert_eq!(Token::StringLiteral("test_00_me"), token.unwrap());

        let mut lexer = Lexer::new("'broken\n'");
        let _ = lexer.next_char(false);
        assert!(lexer.read_str_literal().is_err());
    }

    #[test]
    fn read_number() {
        let program = "123 -456 0x7FC00000 -0x10";
        let mut lexer = Lexer::new(program);
        let _ = lexer.next_char(false);
        assert_eq!(Token::Number(123), lexer.read_number().unwrap().unwrap());
        lexer.trim();
        let _ = lexer.next_char(false);
        assert_eq!(Token::Number(-456), lexer.read_number().unwrap().unwrap());
        assert_eq!(Some(Token::Number(0x7FC0_0000)), lexer.next_token().unwrap());
        assert_eq!(Some(Token::Number(-16)), lexer.next_token().unwrap());

        assert!(Lexer::new("12ab").next_token().is_err());
    }

    #[test]
    fn read_token() {
        let program = "main:\nmul\n";
        let mut lexer = Lexer::new(program);
        let _ = lexer.next_char(false);
        assert_eq!(Token::Name("main"), lexer.read_token().unwrap().unwrap());
        let _ = lexer.next_char(false);
        let _ = lexer.next_char(false);
        let _ = lexer.next_char(false);
        assert_eq!(
            Token::Instruction(Op::Mul),
            lexer.read_token().unwrap().unwrap()
        );
    }

    #[test]
    fn read_program() {
        let program = r"
            .func main c1 4:1 ; one local
            loop:
                streamstr &hello
                jnz l0 >loop
                copy mem:0x100 ram:4
            hello:
                .string 'hello world'
        ";

        let mut lexer = Lexer::new(program);

        let tokens = vec![
            Token::Newline,
            Token::Directive("func"),
            Token::Name("main"),
            Token::Name("c1"),
            Token::Number(4),
            Token::Colon,
            Token::Number(1),
            Token::Newline,
            Token::Name("loop"),
            Token::Colon,
            Token::Newline,
            Token::Instruction(Op::StreamStr),
            Token::Ampersand,
            Token::Name("hello"),
            Token::Newline,
            Token::Instruction(Op::Jnz),
            Token::Name("l0"),
            Token::Greater,
            Token::Name("loop"),
            Token::Newline,
            Token::Instruction(Op::Copy),
            Token::Name("mem"),
            Token::Colon,
            Token::Number(0x100),
            Token::Name("ram"),
            Token::Colon,
            Token::Number(4),
            Token::Newline,
            Token::Name("hello"),
            Token::Colon,
            Token::Newline,
            Token::Directive("string"),
            Token::StringLiteral("hello world"),
            Token::Newline,
        ];

        for token in tokens {
            assert_eq!(token, lexer.next_token().unwrap().unwrap());
        }

        // No tokens left
        assert_eq!(lexer.next_token().unwrap(), None);
    }
}
