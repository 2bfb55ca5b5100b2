//! Argument tokenizer
//!
//! Splits a complete command (literals already inlined by the connection
//! loop) into atoms, strings and parenthesized lists. Bracketed sections
//! such as `BODY.PEEK[HEADER]<0.100>` stay inside a single atom.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    /// Quoted string or literal
    Str(String),
    List(Vec<Token>),
}

impl Token {
    /// Atom or string content
    pub fn as_astring(&self) -> Option<&str> {
        match self {
            Token::Atom(s) | Token::Str(s) => Some(s),
            Token::List(_) => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Token::Atom(s) => Some(s),
            _ => None,
        }
    }
}

pub fn tokenize(input: &[u8]) -> Result<Vec<Token>, String> {
    let mut lexer = Lexer { input, pos: 0 };
    let tokens = lexer.sequence(false)?;
    Ok(tokens)
}

struct Lexer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Lexer<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn sequence(&mut self, in_list: bool) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        loop {
            while self.peek() == Some(b' ') {
                self.pos += 1;
            }
            match self.peek() {
                None if in_list => return Err("Unterminated list".to_string()),
                None => return Ok(tokens),
                Some(b')') if in_list => {
                    self.pos += 1;
                    return Ok(tokens);
                }
                Some(b')') => return Err("Unexpected ')'".to_string()),
                Some(b'(') => {
                    self.pos += 1;
                    tokens.push(Token::List(self.sequence(true)?));
                }
                Some(b'"') => tokens.push(self.quoted()?),
                Some(b'{') => tokens.push(self.literal()?),
                Some(_) => tokens.push(self.atom()?),
            }
        }
    }

    fn quoted(&mut self) -> Result<Token, String> {
        self.pos += 1;
        let mut value = Vec::new();
        loop {
            match self.peek() {
                None | Some(b'\r') | Some(b'\n') => {
                    return Err("Unterminated quoted string".to_string())
                }
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Token::Str(String::from_utf8_lossy(&value).into_owned()));
                }
                Some(b'\\') => {
                    let escaped = self
                        .input
                        .get(self.pos + 1)
                        .copied()
                        .filter(|c| *c == b'"' || *c == b'\\')
                        .ok_or_else(|| "Invalid escape in quoted string".to_string())?;
                    value.push(escaped);
                    self.pos += 2;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn literal(&mut self) -> Result<Token, String> {
        let rest = &self.input[self.pos + 1..];
        let close = rest
            .iter()
            .position(|c| *c == b'}')
            .ok_or_else(|| "Unterminated literal length".to_string())?;
        let len: usize = std::str::from_utf8(&rest[..close])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| "Invalid literal length".to_string())?;

        self.pos += close + 2;
        if self.input[self.pos..].starts_with(b"\r\n") {
            self.pos += 2;
        } else if self.peek() == Some(b'\n') {
            self.pos += 1;
        } else {
            return Err("Literal length must end the line".to_string());
        }

        let data = self
            .input
            .get(self.pos..self.pos + len)
            .ok_or_else(|| "Truncated literal".to_string())?;
        self.pos += len;
        Ok(Token::Str(String::from_utf8_lossy(data).into_owned()))
    }

    fn atom(&mut self) -> Result<Token, String> {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                b'[' => depth += 1,
                b']' if depth > 0 => depth -= 1,
                b' ' | b'(' | b')' if depth == 0 => break,
                b'\r' | b'\n' => return Err("Unexpected line break".to_string()),
                _ => {}
            }
            self.pos += 1;
        }
        if depth > 0 {
            return Err("Unterminated section".to_string());
        }
        Ok(Token::Atom(
            String::from_utf8_lossy(&self.input[start..self.pos]).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(s: &str) -> Token {
        Token::Atom(s.to_string())
    }

    #[test]
    fn test_atoms_strings_and_lists() {
        let tokens = tokenize(br#"a1 LOGIN "bob smith" pass (FLAGS UID)"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                atom("a1"),
                atom("LOGIN"),
                Token::Str("bob smith".to_string()),
                atom("pass"),
                Token::List(vec![atom("FLAGS"), atom("UID")]),
            ]
        );
    }

    #[test]
    fn test_quoted_escapes() {
        let tokens = tokenize(br#""a \"b\" \\c""#).unwrap();
        assert_eq!(tokens, vec![Token::Str(r#"a "b" \c"#.to_string())]);
        assert!(tokenize(br#""bad \n""#).is_err());
        assert!(tokenize(br#""open"#).is_err());
    }

    #[test]
    fn test_sections_stay_in_one_atom() {
        let tokens = tokenize(b"1:* (BODY.PEEK[HEADER.FIELDS (FROM TO)]<0.100> FLAGS)").unwrap();
        assert_eq!(
            tokens,
            vec![
                atom("1:*"),
                Token::List(vec![
                    atom("BODY.PEEK[HEADER.FIELDS (FROM TO)]<0.100>"),
                    atom("FLAGS"),
                ]),
            ]
        );
    }

    #[test]
    fn test_literal() {
        let tokens = tokenize(b"a LOGIN {3}\r\nbob {6}\r\ns3 cr t").unwrap();
        assert_eq!(
            tokens,
            vec![
                atom("a"),
                atom("LOGIN"),
                Token::Str("bob".to_string()),
                Token::Str("s3 cr ".to_string()),
                atom("t"),
            ]
        );
        assert!(tokenize(b"a {10}\r\nshort").is_err());
    }

    #[test]
    fn test_unbalanced_parens() {
        assert!(tokenize(b"(a b").is_err());
        assert!(tokenize(b"a b)").is_err());
    }
}
