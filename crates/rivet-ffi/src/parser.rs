//! Parser for textual function declarations.
//!
//! # Format
//!
//! ```text
//! # Comment lines start with #
//!
//! # Declaration: name: (arg_types) -> return_type
//! abs: (int) -> int
//! strlen: (string) -> size_t
//! snprintf: (pointer, size_t, string, ...) -> int
//! ```
//!
//! Type names are not a fixed grammar; they resolve through the registry
//! the caller supplies, so scope-local names and typedefs work in
//! declarations exactly as they do everywhere else. The `...` token is the
//! trailing varargs marker.

use crate::registry::TypeRegistry;
use crate::types::NativeType;

/// A parsed function declaration.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub args: Vec<NativeType>,
    pub ret: NativeType,
}

/// Error during declaration parsing.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line > 0 {
            write!(f, "line {}: {}", self.line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ParseError {}

fn err(line: usize, message: impl Into<String>) -> ParseError {
    ParseError {
        line,
        message: message.into(),
    }
}

/// Parse a single declaration: `name: (arg_types) -> return_type`.
pub fn parse_declaration(input: &str, registry: &TypeRegistry) -> Result<Declaration, ParseError> {
    parse_declaration_line(input.trim(), 0, registry)
}

/// Parse multi-line declaration content. Empty lines and `#` comments are
/// skipped; every other line must be a declaration.
pub fn parse_declarations(
    content: &str,
    registry: &TypeRegistry,
) -> Result<Vec<Declaration>, ParseError> {
    let mut decls = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let line_num = line_num + 1; // 1-indexed for error messages
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        decls.push(parse_declaration_line(line, line_num, registry)?);
    }
    Ok(decls)
}

fn parse_declaration_line(
    line: &str,
    line_num: usize,
    registry: &TypeRegistry,
) -> Result<Declaration, ParseError> {
    let colon_pos = line
        .find(':')
        .ok_or_else(|| err(line_num, "Expected ':' after function name"))?;

    let name = line[..colon_pos].trim().to_string();
    if name.is_empty() {
        return Err(err(line_num, "Function name cannot be empty"));
    }

    let rest = line[colon_pos + 1..].trim();
    let (args, ret) = parse_type_signature(rest, line_num, registry)?;

    Ok(Declaration { name, args, ret })
}

/// Parse `(arg_types) -> return_type`.
fn parse_type_signature(
    s: &str,
    line_num: usize,
    registry: &TypeRegistry,
) -> Result<(Vec<NativeType>, NativeType), ParseError> {
    if !s.starts_with('(') {
        return Err(err(line_num, "Expected '(' at start of type signature"));
    }
    let close_paren = s
        .find(')')
        .ok_or_else(|| err(line_num, "Unmatched '(' in type signature"))?;

    let args_str = &s[1..close_paren];
    let rest = s[close_paren + 1..].trim();

    let rest = rest
        .strip_prefix("->")
        .ok_or_else(|| err(line_num, "Expected '->' after argument list"))?;
    let ret_str = rest.trim();

    let args = parse_arg_list(args_str, line_num, registry)?;
    let ret = resolve_type(ret_str, line_num, registry)?;

    Ok((args, ret))
}

fn parse_arg_list(
    s: &str,
    line_num: usize,
    registry: &TypeRegistry,
) -> Result<Vec<NativeType>, ParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(vec![]);
    }
    s.split(',')
        .map(|part| resolve_type(part.trim(), line_num, registry))
        .collect()
}

fn resolve_type(
    name: &str,
    line_num: usize,
    registry: &TypeRegistry,
) -> Result<NativeType, ParseError> {
    if name.is_empty() {
        return Err(err(line_num, "Empty type name"));
    }
    registry
        .resolve(name)
        .map_err(|_| err(line_num, format!("Unknown type: '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::global_registry;
    use crate::types::TypeKind;

    #[test]
    fn test_parse_simple_declaration() {
        let decl = parse_declaration("abs: (int) -> int", global_registry()).unwrap();
        assert_eq!(decl.name, "abs");
        assert_eq!(decl.args.len(), 1);
        assert!(matches!(decl.args[0].kind(), TypeKind::I32));
        assert!(matches!(decl.ret.kind(), TypeKind::I32));
    }

    #[test]
    fn test_parse_nullary() {
        let decl = parse_declaration("getpid: () -> int", global_registry()).unwrap();
        assert!(decl.args.is_empty());
    }

    #[test]
    fn test_parse_varargs_token() {
        let decl = parse_declaration(
            "snprintf: (pointer, size_t, string, ...) -> int",
            global_registry(),
        )
        .unwrap();
        assert_eq!(decl.args.len(), 4);
        assert!(matches!(decl.args[3].kind(), TypeKind::Varargs));
    }

    #[test]
    fn test_scope_local_names_resolve() {
        let registry = TypeRegistry::new();
        registry.typedef("pointer", "window").unwrap();
        let decl = parse_declaration("show: (window) -> void", &registry).unwrap();
        assert!(matches!(decl.args[0].kind(), TypeKind::Pointer));
    }

    #[test]
    fn test_parse_errors() {
        let g = global_registry();
        assert!(parse_declaration("no_colon (int) -> int", g).is_err());
        assert!(parse_declaration(": (int) -> int", g).is_err());
        assert!(parse_declaration("f: int -> int", g).is_err());
        assert!(parse_declaration("f: (int) int", g).is_err());
        assert!(parse_declaration("f: (mystery) -> int", g).is_err());
    }

    #[test]
    fn test_parse_multi_line_content() {
        let content = r#"
# libc bindings
abs: (int) -> int
strlen: (string) -> size_t

usleep: (uint) -> int
"#;
        let decls = parse_declarations(content, global_registry()).unwrap();
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].name, "abs");
        assert_eq!(decls[2].name, "usleep");
    }

    #[test]
    fn test_error_carries_line_number() {
        let content = "abs: (int) -> int\nbroken line\n";
        let e = parse_declarations(content, global_registry()).unwrap_err();
        assert_eq!(e.line, 2);
        assert!(e.to_string().contains("line 2"));
    }
}
