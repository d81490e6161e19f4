//! Parser for the trace text format
//!
//! A trace file starts with optional declarations, followed by `---`, the
//! input argument list and one operation per line:
//!
//! ```text
//! struct Node class=1 { value: int, next: ref }
//! call f(int) -> int elidable
//! ---
//! [i0, p1]
//! i2 = int_add(i0, 1)
//! setfield_gc(p1, i2, descr=Node.value)
//! jump(i0, p1)
//! ```
//!
//! Value names carry their type in the first letter (`i`, `p`, `f`).

use super::descr::{CallDescr, Descr, DescrTable, EffectFlags, EffectInfo, OopSpec};
use super::{Const, Op, OpCode, OpRef, Operand, RefConst, StrConst, StrMode, Trace, Type};
use crate::error::{Error, Result, SourceLocation};
use rustc_hash::FxHashMap as HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str { text: String, unicode: bool },
    Punct(char),
    Arrow,
    Separator,
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    location: SourceLocation,
}

/// Tokenizer for the trace text format
struct Lexer<'src> {
    source: &'src str,
    pos: usize,
    line: u32,
    column: u32,
}

impl<'src> Lexer<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            source,
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn location(&self) -> SourceLocation {
        SourceLocation {
            line: self.line,
            column: self.column,
        }
    }

    fn error(&self, message: impl Into<String>, location: SourceLocation) -> Error {
        Error::parse_error_with_context(message, location, self.source)
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            // Skip blanks and comments, but not newlines
            while let Some(c) = self.peek() {
                if c == '#' {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                } else if c.is_whitespace() && c != '\n' {
                    self.advance();
                } else {
                    break;
                }
            }
            let location = self.location();
            let Some(c) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    location,
                });
                return Ok(tokens);
            };
            let kind = match c {
                '\n' => {
                    self.advance();
                    TokenKind::Newline
                }
                '-' if self.source[self.pos..].starts_with("---") => {
                    while self.peek() == Some('-') {
                        self.advance();
                    }
                    TokenKind::Separator
                }
                '-' if self.peek_next() == Some('>') => {
                    self.advance();
                    self.advance();
                    TokenKind::Arrow
                }
                '-' | '0'..='9' => self.read_number(location)?,
                '"' => {
                    let text = self.read_string(location)?;
                    TokenKind::Str {
                        text,
                        unicode: false,
                    }
                }
                'u' if self.peek_next() == Some('"') => {
                    self.advance();
                    let text = self.read_string(location)?;
                    TokenKind::Str {
                        text,
                        unicode: true,
                    }
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = self.pos;
                    while let Some(c) = self.peek() {
                        if c.is_alphanumeric() || c == '_' || c == '.' {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    TokenKind::Ident(self.source[start..self.pos].to_string())
                }
                '(' | ')' | '[' | ']' | '{' | '}' | ',' | ':' | '=' | '<' | '>' => {
                    self.advance();
                    TokenKind::Punct(c)
                }
                other => {
                    return Err(self.error(format!("unexpected character '{}'", other), location))
                }
            };
            tokens.push(Token { kind, location });
        }
    }

    fn read_number(&mut self, location: SourceLocation) -> Result<TokenKind> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.advance();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.advance();
            } else if c == '.' || c == 'e' || c == 'E' {
                is_float = true;
                self.advance();
                if matches!(self.peek(), Some('-') | Some('+')) {
                    self.advance();
                }
            } else {
                break;
            }
        }
        let text = &self.source[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(format!("invalid float '{}'", text), location))
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(format!("invalid integer '{}'", text), location))
        }
    }

    fn read_string(&mut self, location: SourceLocation) -> Result<String> {
        self.advance(); // opening quote
        let mut text = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated string", location)),
                Some('"') => return Ok(text),
                Some('\\') => match self.advance() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('0') => text.push('\0'),
                    Some(c) => text.push(c),
                    None => return Err(self.error("unterminated string", location)),
                },
                Some(c) => text.push(c),
            }
        }
    }
}

/// Parse a trace in the text format
pub fn parse_trace(source: &str) -> Result<Trace> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        descrs: DescrTable::new(),
        values: HashMap::default(),
        known: Vec::new(),
    };
    parser.parse_header()?;
    // the body still looks descriptors up by name
    let mut trace = Trace::new(Rc::new(parser.descrs.clone()));
    parser.parse_body(&mut trace)?;
    for (key, value) in std::mem::take(&mut parser.known) {
        trace.call_pure_results.insert(key, value);
    }
    Ok(trace)
}

struct Parser<'src> {
    source: &'src str,
    tokens: Vec<Token>,
    pos: usize,
    descrs: DescrTable,
    values: HashMap<String, OpRef>,
    known: Vec<((super::DescrRef, Vec<Const>), Const)>,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].kind
    }

    fn location(&self) -> SourceLocation {
        self.tokens[self.pos.min(self.tokens.len() - 1)].location
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse_error_with_context(message, self.location(), self.source)
    }

    fn check_punct(&self, c: char) -> bool {
        self.peek() == &TokenKind::Punct(c)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.check_punct(c) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn expect_int(&mut self) -> Result<i64> {
        match self.peek().clone() {
            TokenKind::Int(v) => {
                self.advance();
                Ok(v)
            }
            _ => Err(self.error("expected integer")),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek() == &TokenKind::Newline {
            self.advance();
        }
    }

    fn expect_line_end(&mut self) -> Result<()> {
        match self.peek() {
            TokenKind::Newline => {
                self.advance();
                Ok(())
            }
            TokenKind::Eof => Ok(()),
            _ => Err(self.error("expected end of line")),
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        let name = self.expect_ident()?;
        match name.as_str() {
            "int" => Ok(Type::Int),
            "ref" => Ok(Type::Ref),
            "float" => Ok(Type::Float),
            "void" => Ok(Type::Void),
            other => Err(self.error(format!("unknown type '{}'", other))),
        }
    }

    fn lookup_descr(&self, name: &str) -> Result<super::DescrRef> {
        self.descrs
            .lookup(name)
            .ok_or_else(|| self.error(format!("unknown descriptor '{}'", name)))
    }

    // ========== Declarations ==========

    fn parse_header(&mut self) -> Result<()> {
        let has_separator = self.tokens.iter().any(|t| t.kind == TokenKind::Separator);
        if !has_separator {
            return Ok(());
        }
        loop {
            self.skip_newlines();
            match self.advance() {
                TokenKind::Separator => return self.expect_line_end(),
                TokenKind::Ident(word) => match word.as_str() {
                    "struct" => self.parse_struct()?,
                    "array" => self.parse_array()?,
                    "call" => self.parse_call()?,
                    "object" => self.parse_object()?,
                    "known" => self.parse_known()?,
                    other => return Err(self.error(format!("unknown declaration '{}'", other))),
                },
                _ => return Err(self.error("expected a declaration")),
            }
            self.expect_line_end()?;
        }
    }

    fn parse_struct(&mut self) -> Result<()> {
        let name = self.expect_ident()?;
        let mut vtable = None;
        let mut immutable = false;
        while let TokenKind::Ident(word) = self.peek().clone() {
            self.advance();
            match word.as_str() {
                "class" => {
                    self.expect_punct('=')?;
                    vtable = Some(self.expect_int()?);
                }
                "immutable" => immutable = true,
                other => return Err(self.error(format!("unknown struct option '{}'", other))),
            }
        }
        let size = self.descrs.add_struct(&name, vtable, immutable);
        self.expect_punct('{')?;
        while !self.eat_punct('}') {
            let mut pure = false;
            let mut quasi = false;
            let mut field = self.expect_ident()?;
            if field == "pure" || field == "quasi" {
                pure = field == "pure";
                quasi = field == "quasi";
                field = self.expect_ident()?;
            }
            self.expect_punct(':')?;
            let ty = self.parse_type()?;
            self.descrs.add_field_ext(size, &field, ty, pure, quasi);
            if !self.eat_punct(',') {
                self.expect_punct('}')?;
                break;
            }
        }
        Ok(())
    }

    fn parse_array(&mut self) -> Result<()> {
        let name = self.expect_ident()?;
        if self.eat_punct('{') {
            let mut fields = Vec::new();
            while !self.eat_punct('}') {
                let field = self.expect_ident()?;
                self.expect_punct(':')?;
                fields.push((field, self.parse_type()?));
                if !self.eat_punct(',') {
                    self.expect_punct('}')?;
                    break;
                }
            }
            let (item_size, immutable) = self.parse_array_options(8 * fields.len() as i64)?;
            let array = self.descrs.add_array(&name, Type::Void, item_size, immutable);
            for (field, ty) in fields {
                self.descrs.add_interior_field(array, &field, ty);
            }
        } else {
            let item_ty = self.parse_type()?;
            let (item_size, immutable) = self.parse_array_options(8)?;
            self.descrs.add_array(&name, item_ty, item_size, immutable);
        }
        Ok(())
    }

    fn parse_array_options(&mut self, default_size: i64) -> Result<(i64, bool)> {
        let mut item_size = default_size;
        let mut immutable = false;
        while let TokenKind::Ident(word) = self.peek().clone() {
            self.advance();
            match word.as_str() {
                "size" => {
                    self.expect_punct('=')?;
                    item_size = self.expect_int()?;
                }
                "immutable" => immutable = true,
                other => return Err(self.error(format!("unknown array option '{}'", other))),
            }
        }
        Ok((item_size, immutable))
    }

    fn parse_call(&mut self) -> Result<()> {
        let name = self.expect_ident()?;
        self.expect_punct('(')?;
        let mut arg_types = Vec::new();
        while !self.eat_punct(')') {
            arg_types.push(self.parse_type()?);
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }
        if self.advance() != TokenKind::Arrow {
            return Err(self.error("expected '->'"));
        }
        let result = self.parse_type()?;
        let mut effect = EffectInfo::default();
        while let TokenKind::Ident(word) = self.peek().clone() {
            self.advance();
            match word.as_str() {
                "random" => effect.flags |= EffectFlags::RANDOM_EFFECTS,
                "elidable" => effect.flags |= EffectFlags::ELIDABLE,
                "can_raise" => effect.flags |= EffectFlags::CAN_RAISE,
                "forces" => effect.flags |= EffectFlags::FORCES_VIRTUAL_OR_VIRTUALIZABLE,
                "can_invalidate" => effect.flags |= EffectFlags::CAN_INVALIDATE,
                "loopinvariant" => effect.flags |= EffectFlags::LOOP_INVARIANT,
                "can_collect" => effect.flags |= EffectFlags::CAN_COLLECT,
                "reads" | "writes" => {
                    self.expect_punct('=')?;
                    loop {
                        let target = self.expect_ident()?;
                        let descr = self.lookup_descr(&target)?;
                        let is_write = word == "writes";
                        match self.descrs.get(descr) {
                            Some(Descr::Field(_)) => {
                                if is_write {
                                    effect.write_fields.push(descr);
                                } else {
                                    effect.read_fields.push(descr);
                                }
                            }
                            Some(Descr::Array(_)) => {
                                if is_write {
                                    effect.write_arrays.push(descr);
                                } else {
                                    effect.read_arrays.push(descr);
                                }
                            }
                            Some(Descr::InteriorField(f)) => {
                                let array = f.array;
                                if is_write {
                                    effect.write_arrays.push(array);
                                } else {
                                    effect.read_arrays.push(array);
                                }
                            }
                            _ => {
                                return Err(self.error(format!(
                                    "'{}' is not a field or an array",
                                    target
                                )))
                            }
                        }
                        if !self.eat_punct(',') {
                            break;
                        }
                    }
                }
                "oopspec" => {
                    self.expect_punct('=')?;
                    let spec = self.expect_ident()?;
                    let spec = OopSpec::from_name(&spec)
                        .ok_or_else(|| self.error(format!("unknown oopspec '{}'", spec)))?;
                    effect.oopspec = Some(spec);
                }
                "storage" => {
                    self.expect_punct('=')?;
                    let target = self.expect_ident()?;
                    effect.dict_storage = Some(self.lookup_descr(&target)?);
                }
                other => return Err(self.error(format!("unknown call flag '{}'", other))),
            }
        }
        self.descrs.add_call(CallDescr {
            name,
            arg_types,
            result,
            effect,
        });
        Ok(())
    }

    fn parse_object(&mut self) -> Result<()> {
        let name = self.expect_ident()?;
        self.expect_punct(':')?;
        let layout = self.expect_ident()?;
        let size = self.lookup_descr(&layout)?;
        if self.descrs.size(size).is_none() {
            return Err(self.error(format!("'{}' is not a struct", layout)));
        }
        self.descrs.add_object(&name, size);
        Ok(())
    }

    fn parse_known(&mut self) -> Result<()> {
        let name = self.expect_ident()?;
        let descr = self.lookup_descr(&name)?;
        self.expect_punct('(')?;
        let mut args = Vec::new();
        while !self.eat_punct(')') {
            match self.parse_operand()? {
                Operand::Const(c) => args.push(c),
                Operand::Op(_) => return Err(self.error("known results take constants only")),
            }
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }
        self.expect_punct('=')?;
        let result = match self.parse_operand()? {
            Operand::Const(c) => c,
            Operand::Op(_) => return Err(self.error("known results take constants only")),
        };
        self.known.push(((descr, args), result));
        Ok(())
    }

    // ========== Operations ==========

    fn parse_body(&mut self, trace: &mut Trace) -> Result<()> {
        self.skip_newlines();
        self.expect_punct('[')?;
        while !self.eat_punct(']') {
            let name = self.expect_ident()?;
            let ty = self.type_of_name(&name)?;
            let r = trace.add_inputarg(ty);
            self.values.insert(name, r);
            if !self.eat_punct(',') {
                self.expect_punct(']')?;
                break;
            }
        }
        self.expect_line_end()?;
        loop {
            self.skip_newlines();
            if self.peek() == &TokenKind::Eof {
                return Ok(());
            }
            self.parse_op(trace)?;
            self.expect_line_end()?;
        }
    }

    fn type_of_name(&self, name: &str) -> Result<Type> {
        match name.chars().next() {
            Some('i') => Ok(Type::Int),
            Some('p') => Ok(Type::Ref),
            Some('f') => Ok(Type::Float),
            _ => Err(self.error(format!(
                "value name '{}' must start with i, p or f",
                name
            ))),
        }
    }

    fn parse_op(&mut self, trace: &mut Trace) -> Result<()> {
        let first = self.expect_ident()?;
        let (result, opname) = if self.eat_punct('=') {
            (Some(first), self.expect_ident()?)
        } else {
            (None, first)
        };
        let opcode = OpCode::from_name(&opname)
            .ok_or_else(|| self.error(format!("unknown operation '{}'", opname)))?;
        let ty = match &result {
            Some(name) => self.type_of_name(name)?,
            None => Type::Void,
        };
        self.expect_punct('(')?;
        let mut args = Vec::new();
        let mut descr = None;
        while !self.eat_punct(')') {
            if let TokenKind::Ident(word) = self.peek().clone() {
                if word == "descr" {
                    self.advance();
                    self.expect_punct('=')?;
                    if self.eat_punct('<') {
                        // printed guard descriptors carry no information
                        self.expect_ident()?;
                        self.expect_punct('>')?;
                    } else {
                        let name = self.expect_ident()?;
                        descr = Some(self.lookup_descr(&name)?);
                    }
                    if !self.eat_punct(',') {
                        self.expect_punct(')')?;
                        break;
                    }
                    continue;
                }
            }
            args.push(self.parse_operand()?);
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }
        if let Some(arity) = opcode.arity() {
            if args.len() != arity {
                return Err(self.error(format!(
                    "{} takes {} arguments, got {}",
                    opcode,
                    arity,
                    args.len()
                )));
            }
        }
        let mut op = Op::new(opcode, ty, args);
        op.descr = descr;
        if self.eat_punct('[') {
            let mut fail_args = Vec::new();
            while !self.eat_punct(']') {
                fail_args.push(self.parse_operand()?);
                if !self.eat_punct(',') {
                    self.expect_punct(']')?;
                    break;
                }
            }
            op.fail_args = Some(fail_args);
        } else if opcode.is_guard() {
            op.fail_args = Some(Vec::new());
        }
        let r = trace.push(op);
        if let Some(name) = result {
            if self.values.insert(name.clone(), r).is_some() {
                return Err(self.error(format!("value '{}' defined twice", name)));
            }
        }
        Ok(())
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        match self.advance() {
            TokenKind::Int(v) => Ok(Operand::int(v)),
            TokenKind::Float(v) => Ok(Operand::Const(Const::float(v))),
            TokenKind::Str { text, unicode } => {
                let mode = if unicode { StrMode::Unicode } else { StrMode::Str };
                Ok(Operand::Const(Const::Ref(RefConst::Str(StrConst::new(
                    mode, &text,
                )))))
            }
            TokenKind::Ident(name) => match name.as_str() {
                "NULL" => Ok(Operand::null()),
                "ConstClass" => {
                    self.expect_punct('(')?;
                    let layout = self.expect_ident()?;
                    self.expect_punct(')')?;
                    let descr = self.lookup_descr(&layout)?;
                    let class = self
                        .descrs
                        .size(descr)
                        .and_then(|s| s.vtable)
                        .ok_or_else(|| self.error(format!("'{}' has no class", layout)))?;
                    Ok(Operand::int(class))
                }
                "ConstPtr" => {
                    self.expect_punct('(')?;
                    let object = self.expect_ident()?;
                    self.expect_punct(')')?;
                    let id = self
                        .descrs
                        .object_by_name(&object)
                        .ok_or_else(|| self.error(format!("unknown object '{}'", object)))?;
                    let class = self.descrs.objects()[id as usize].1;
                    let class = self.descrs.size(class).and_then(|s| s.vtable);
                    Ok(Operand::Const(Const::Ref(RefConst::Obj { id, class })))
                }
                _ => self
                    .values
                    .get(&name)
                    .map(|&r| Operand::Op(r))
                    .ok_or_else(|| self.error(format!("undefined value '{}'", name))),
            },
            _ => Err(self.error("expected an operand")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let trace = parse_trace("[i0]\ni1 = int_add(i0, 1)\nfinish(i1)\n").unwrap();
        assert_eq!(trace.inputargs.len(), 1);
        assert_eq!(trace.opcodes(), vec![OpCode::IntAdd, OpCode::Finish]);
        assert_eq!(trace.to_string(), "[i0]\ni1 = int_add(i0, 1)\nfinish(i1)\n");
    }

    #[test]
    fn test_parse_declarations() {
        let source = r#"
struct Node class=1 { value: int, next: ref, pure name: ref }
array Arr int
array Points { x: int, y: float }
call f(int, int) -> int elidable writes=Node.value
object o1: Node
known f(1, 2) = 3
---
[i0, p1]
p2 = new_with_vtable(descr=Node)
setfield_gc(p2, i0, descr=Node.value)
i3 = call_i(1, 2, descr=f)
guard_class(p1, ConstClass(Node)) [i0]
escape(p2, ConstPtr(o1), "ab", u"c")
jump(i0, p1)
"#;
        let trace = parse_trace(source).unwrap();
        let f = trace.descrs.lookup("f").unwrap();
        assert_eq!(
            trace.call_pure_results.get(&(f, vec![Const::Int(1), Const::Int(2)])),
            Some(&Const::Int(3))
        );
        let node_value = trace.descrs.lookup("Node.value").unwrap();
        assert!(trace.descrs.effect(f).unwrap().writes_field(node_value));
        assert!(trace.descrs.is_always_pure(trace.descrs.lookup("Node.name").unwrap()));
        assert!(trace.descrs.array(trace.descrs.lookup("Points").unwrap()).unwrap().is_array_of_structs());
        let guard = trace.iter().find(|(_, op)| op.opcode == OpCode::GuardClass).unwrap().1;
        assert_eq!(guard.args[1], Operand::int(1));
        assert_eq!(guard.fail_args.as_ref().map(|a| a.len()), Some(1));
        let text = trace.to_string();
        assert!(text.contains("escape(p2, ConstPtr(o1), \"ab\", u\"c\")"), "{}", text);
    }

    #[test]
    fn test_parse_body_descr_reference() {
        let source = "struct Node class=1 { value: int }\n---\n[p0]\n\
                      i1 = getfield_gc_i(p0, descr=Node.value)\n\
                      finish(i1)\n";
        let trace = parse_trace(source).unwrap();
        let value = trace.descrs.lookup("Node.value").unwrap();
        let read = trace.iter().find(|(_, op)| op.opcode == OpCode::GetfieldGc).unwrap().1;
        assert_eq!(read.descr, Some(value));
        assert!(trace.to_string().contains("descr=Node.value"));
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_trace("[i0]\ni1 = int_add(i0, i9)\n").unwrap_err();
        assert!(err.to_string().contains("undefined value 'i9'"));
        assert!(err.to_string().contains("2:"));

        let err = parse_trace("[i0]\ni1 = int_frobnicate(i0)\n").unwrap_err();
        assert!(err.to_string().contains("unknown operation"));

        let err = parse_trace("[i0]\ni1 = int_add(i0)\n").unwrap_err();
        assert!(err.to_string().contains("takes 2 arguments"));

        let err = parse_trace("---\n[x0]\n").unwrap_err();
        assert!(err.to_string().contains("must start with i, p or f"));
    }

    #[test]
    fn test_parse_comments_and_floats() {
        let source = "# header comment\n[f0]\nf1 = float_add(f0, -1.5) # trailing\nfinish(f1)\n";
        let trace = parse_trace(source).unwrap();
        let op = trace.op(trace.ops[0]);
        assert_eq!(op.args[1], Operand::Const(Const::float(-1.5)));
    }
}
