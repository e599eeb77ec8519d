//! The D-Bus type signature grammar:
//!
//! ```text
//! basic     := y|b|n|q|i|u|x|t|d|s|o|g|h
//! complete  := basic | 'v' | '(' complete+ ')' | 'a' complete | 'a{' basic complete '}'
//! signature := complete*
//! ```
//!
//! A variant-scoped signature is exactly one complete type.

use crate::CursorState;

pub(crate) const MAX_SIGNATURE_LENGTH: usize = 255;
pub(crate) const MAX_ARRAY_LENGTH: u32 = 67_108_864;

/// Whether a signature describes a whole argument list or the single
/// complete type carried inline by a variant.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SignatureType {
    Full,
    Variant,
}

/// Aggregate nesting counters with the limits from the D-Bus spec.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Nesting {
    pub(crate) array: u32,
    pub(crate) paren: u32,
    pub(crate) variant: u32,
}

impl Nesting {
    const ARRAY_MAX: u32 = 32;
    const PAREN_MAX: u32 = 32;
    const TOTAL_MAX: u32 = 64;

    pub(crate) fn new() -> Nesting {
        Nesting::default()
    }

    pub(crate) fn begin_array(&mut self) -> bool {
        self.array += 1;
        self.array <= Nesting::ARRAY_MAX && self.total() <= Nesting::TOTAL_MAX
    }

    pub(crate) fn end_array(&mut self) {
        self.array -= 1;
    }

    pub(crate) fn begin_paren(&mut self) -> bool {
        self.paren += 1;
        self.paren <= Nesting::PAREN_MAX && self.total() <= Nesting::TOTAL_MAX
    }

    pub(crate) fn end_paren(&mut self) {
        self.paren -= 1;
    }

    pub(crate) fn begin_variant(&mut self) -> bool {
        self.variant += 1;
        self.total() <= Nesting::TOTAL_MAX
    }

    pub(crate) fn end_variant(&mut self) {
        self.variant -= 1;
    }

    fn total(&self) -> u32 {
        self.array + self.paren + self.variant
    }
}

fn parse_basic_type(s: &mut &[u8]) -> bool {
    match s.first() {
        Some(b'y') | Some(b'b') | Some(b'n') | Some(b'q') | Some(b'i') | Some(b'u')
        | Some(b'x') | Some(b't') | Some(b'd') | Some(b's') | Some(b'o') | Some(b'g')
        | Some(b'h') => {
            *s = &s[1..];
            true
        }
        _ => false,
    }
}

fn parse_single_complete_type(s: &mut &[u8], nest: &mut Nesting) -> bool {
    let c = match s.first() {
        Some(&c) => c,
        None => return false,
    };
    match c {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' => {
            *s = &s[1..];
            true
        }
        b'v' => {
            if !nest.begin_variant() {
                return false;
            }
            *s = &s[1..];
            nest.end_variant();
            true
        }
        b'(' => {
            if !nest.begin_paren() {
                return false;
            }
            *s = &s[1..];
            let mut is_empty_struct = true;
            while parse_single_complete_type(s, nest) {
                is_empty_struct = false;
            }
            if is_empty_struct || s.first() != Some(&b')') {
                return false;
            }
            *s = &s[1..];
            nest.end_paren();
            true
        }
        b'a' => {
            if !nest.begin_array() {
                return false;
            }
            *s = &s[1..];
            if s.first() == Some(&b'{') {
                // an array of dict entries, i.e. a dict
                if !nest.begin_paren() {
                    return false;
                }
                *s = &s[1..];
                // key must be a basic type, value can be any complete type
                if !parse_basic_type(s) || !parse_single_complete_type(s, nest) {
                    return false;
                }
                if s.first() != Some(&b'}') {
                    return false;
                }
                *s = &s[1..];
                nest.end_paren();
            } else if !parse_single_complete_type(s, nest) {
                return false;
            }
            nest.end_array();
            true
        }
        _ => false,
    }
}

/// Checks a signature against the grammar and the nesting limits.
pub fn is_signature_valid(signature: &[u8], kind: SignatureType) -> bool {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return false;
    }
    let mut nest = Nesting::new();
    let mut rest = signature;
    match kind {
        SignatureType::Variant => {
            if !parse_single_complete_type(&mut rest, &mut nest) || !rest.is_empty() {
                return false;
            }
        }
        SignatureType::Full => {
            while !rest.is_empty() {
                if !parse_single_complete_type(&mut rest, &mut nest) {
                    return false;
                }
            }
        }
    }
    // the parser closes every aggregate it opens
    debug_assert!(nest.array == 0 && nest.paren == 0 && nest.variant == 0);
    true
}

/// A wire string may not contain an embedded NUL. The terminating NUL is
/// part of the wire encoding, not of the value checked here.
pub fn is_string_valid(string: &[u8]) -> bool {
    string.iter().all(|&b| b != 0)
}

fn is_object_name_letter(b: u8) -> bool {
    (b >= b'a' && b <= b'z') || b == b'_' || (b >= b'A' && b <= b'Z') || (b >= b'0' && b <= b'9')
}

/// Object paths: `/`, or `/`-separated non-empty `[A-Za-z0-9_]` segments
/// with no trailing slash.
pub fn is_object_path_valid(path: &[u8]) -> bool {
    let mut last_letter = match path.first() {
        Some(&b'/') => b'/',
        _ => return false,
    };
    if path.len() == 1 {
        return true; // "/" special case
    }
    for &current_letter in &path[1..] {
        if last_letter == b'/' {
            if !is_object_name_letter(current_letter) {
                return false;
            }
        } else if current_letter != b'/' && !is_object_name_letter(current_letter) {
            return false;
        }
        last_letter = current_letter;
    }
    last_letter != b'/'
}

pub(crate) struct TypeInfo {
    pub(crate) state: CursorState,
    pub(crate) alignment: usize,
    pub(crate) is_primitive: bool,
    pub(crate) is_string_like: bool,
}

impl TypeInfo {
    fn new(state: CursorState, alignment: usize, is_primitive: bool, is_string_like: bool) -> Self {
        TypeInfo {
            state,
            alignment,
            is_primitive,
            is_string_like,
        }
    }
}

/// Maps a signature character to its cursor state, alignment and kind.
/// The `a` entry carries the alignment of the array length prefix; the
/// element type re-aligns the data separately.
pub(crate) fn type_info(letter_code: u8) -> TypeInfo {
    match letter_code {
        b'y' => TypeInfo::new(CursorState::Byte, 1, true, false),
        b'b' => TypeInfo::new(CursorState::Boolean, 4, true, false),
        b'n' => TypeInfo::new(CursorState::Int16, 2, true, false),
        b'q' => TypeInfo::new(CursorState::Uint16, 2, true, false),
        b'i' => TypeInfo::new(CursorState::Int32, 4, true, false),
        b'u' => TypeInfo::new(CursorState::Uint32, 4, true, false),
        b'x' => TypeInfo::new(CursorState::Int64, 8, true, false),
        b't' => TypeInfo::new(CursorState::Uint64, 8, true, false),
        b'd' => TypeInfo::new(CursorState::Double, 8, true, false),
        b's' => TypeInfo::new(CursorState::String, 4, false, true),
        b'o' => TypeInfo::new(CursorState::ObjectPath, 4, false, true),
        b'g' => TypeInfo::new(CursorState::Signature, 1, false, true),
        // handled like a primitive with the fd table lookup left to the caller
        b'h' => TypeInfo::new(CursorState::UnixFd, 4, true, false),
        b'v' => TypeInfo::new(CursorState::BeginVariant, 1, false, false),
        b'(' => TypeInfo::new(CursorState::BeginStruct, 8, false, false),
        b')' => TypeInfo::new(CursorState::EndStruct, 1, false, false),
        b'a' => TypeInfo::new(CursorState::BeginArray, 4, false, false),
        b'{' => TypeInfo::new(CursorState::BeginDict, 8, false, false),
        b'}' => TypeInfo::new(CursorState::EndDict, 1, false, false),
        // alignment 1: don't move the data position for unknown types
        _ => TypeInfo::new(CursorState::InvalidData, 1, false, false),
    }
}
