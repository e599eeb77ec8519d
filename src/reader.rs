//! The decoding cursor. It walks the signature and the payload of an
//! `Arguments` value in lockstep, surfacing one state per call site and
//! rolling back to the pre-attempt position whenever the payload turns out
//! to be truncated.

use std::mem;
use std::str;

use crate::basic_io::{self, align_up};
use crate::signature::{
    is_object_path_valid, is_signature_valid, is_string_valid, type_info, Nesting, SignatureType,
    MAX_ARRAY_LENGTH,
};
use crate::{Arguments, CursorState};

/// Where the cursor currently reads signature characters from: the
/// signature of the `Arguments` value, or an inline variant signature that
/// lives in the payload. Indices instead of borrows, so `replace_data` can
/// swap the backing buffer.
#[derive(Clone, Copy, Debug)]
enum SigSource {
    Main,
    Inline { start: usize, len: usize },
}

#[derive(Clone, Copy, Debug)]
enum Aggregate {
    Struct,
    Variant {
        saved_source: SigSource,
        saved_pos: usize,
    },
    Array {
        is_dict: bool,
        contained_type_begin: usize,
        data_end: usize,
    },
}

#[derive(Clone, Debug)]
enum Value {
    None,
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Text(String),
}

/// Decoding cursor over one `Arguments` value.
///
/// Drive it by inspecting [`state()`](Reader::state) and calling the
/// matching transition; a transition called in any other state moves the
/// cursor to `InvalidData`.
pub struct Reader<'a> {
    args: &'a Arguments,
    state: CursorState,
    value: Value,
    sig: SigSource,
    sig_pos: usize,
    data_pos: usize,
    replaced: Option<Vec<u8>>,
    stack: Vec<Aggregate>,
    nesting: Nesting,
    zero_length_array_nesting: u32,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(args: &'a Arguments) -> Reader<'a> {
        let mut reader = Reader {
            args,
            state: CursorState::NotStarted,
            value: Value::None,
            sig: SigSource::Main,
            sig_pos: 0,
            data_pos: 0,
            replaced: None,
            stack: Vec::new(),
            nesting: Nesting::new(),
            zero_length_array_nesting: 0,
        };
        // aggregate nesting across variants cannot be checked up front;
        // inline variant signatures are validated as they are encountered
        if is_signature_valid(args.signature(), SignatureType::Full) {
            reader.advance_state();
        } else {
            reader.state = CursorState::InvalidData;
        }
        reader
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The kinds of the currently open aggregates, outermost first.
    pub fn aggregate_stack(&self) -> Vec<CursorState> {
        self.stack
            .iter()
            .map(|frame| match *frame {
                Aggregate::Struct => CursorState::BeginStruct,
                Aggregate::Variant { .. } => CursorState::BeginVariant,
                Aggregate::Array { is_dict: false, .. } => CursorState::BeginArray,
                Aggregate::Array { is_dict: true, .. } => CursorState::BeginDict,
            })
            .collect()
    }

    /// Installs a longer payload buffer after `NeedMoreData` and retries
    /// the transition that ran out of bytes. The new buffer must start
    /// with the bytes the cursor has already seen.
    pub fn replace_data<D: Into<Vec<u8>>>(&mut self, data: D) {
        self.replaced = Some(data.into());
        if self.state == CursorState::NeedMoreData {
            self.advance_state();
        }
    }

    fn data(&self) -> &[u8] {
        match &self.replaced {
            Some(data) => data,
            None => self.args.data(),
        }
    }

    fn is_swapped(&self) -> bool {
        self.args.is_byte_swapped()
    }

    fn sig_len(&self) -> usize {
        match self.sig {
            SigSource::Main => self.args.signature().len(),
            SigSource::Inline { len, .. } => len,
        }
    }

    fn sig_at(&self, index: usize) -> u8 {
        match self.sig {
            SigSource::Main => self.args.signature()[index],
            SigSource::Inline { start, .. } => self.data()[start + index],
        }
    }

    // readers of scalar states; each returns the decoded value and
    // advances to the next state

    pub fn read_byte(&mut self) -> u8 {
        match self.take_value(CursorState::Byte) {
            Value::Byte(v) => v,
            _ => 0,
        }
    }

    pub fn read_boolean(&mut self) -> bool {
        match self.take_value(CursorState::Boolean) {
            Value::Boolean(v) => v,
            _ => false,
        }
    }

    pub fn read_int16(&mut self) -> i16 {
        match self.take_value(CursorState::Int16) {
            Value::Int16(v) => v,
            _ => 0,
        }
    }

    pub fn read_uint16(&mut self) -> u16 {
        match self.take_value(CursorState::Uint16) {
            Value::Uint16(v) => v,
            _ => 0,
        }
    }

    pub fn read_int32(&mut self) -> i32 {
        match self.take_value(CursorState::Int32) {
            Value::Int32(v) => v,
            _ => 0,
        }
    }

    pub fn read_uint32(&mut self) -> u32 {
        match self.take_value(CursorState::Uint32) {
            Value::Uint32(v) => v,
            _ => 0,
        }
    }

    pub fn read_int64(&mut self) -> i64 {
        match self.take_value(CursorState::Int64) {
            Value::Int64(v) => v,
            _ => 0,
        }
    }

    pub fn read_uint64(&mut self) -> u64 {
        match self.take_value(CursorState::Uint64) {
            Value::Uint64(v) => v,
            _ => 0,
        }
    }

    pub fn read_double(&mut self) -> f64 {
        match self.take_value(CursorState::Double) {
            Value::Double(v) => v,
            _ => 0.0,
        }
    }

    pub fn read_string(&mut self) -> String {
        match self.take_value(CursorState::String) {
            Value::Text(v) => v,
            _ => String::new(),
        }
    }

    pub fn read_object_path(&mut self) -> String {
        match self.take_value(CursorState::ObjectPath) {
            Value::Text(v) => v,
            _ => String::new(),
        }
    }

    pub fn read_signature(&mut self) -> String {
        match self.take_value(CursorState::Signature) {
            Value::Text(v) => v,
            _ => String::new(),
        }
    }

    /// Reads the 4-byte index slot of an `h` argument. Resolving the index
    /// against the message's file descriptor table is up to the transport.
    pub fn read_unix_fd(&mut self) -> u32 {
        match self.take_value(CursorState::UnixFd) {
            Value::Uint32(v) => v,
            _ => 0,
        }
    }

    fn take_value(&mut self, expected: CursorState) -> Value {
        if self.state != expected {
            self.state = CursorState::InvalidData;
            return Value::None;
        }
        let value = mem::replace(&mut self.value, Value::None);
        self.advance_state();
        value
    }

    // structural transitions

    pub fn begin_struct(&mut self) {
        self.advance_state_from(CursorState::BeginStruct);
    }

    pub fn end_struct(&mut self) {
        self.advance_state_from(CursorState::EndStruct);
    }

    pub fn begin_variant(&mut self) {
        self.advance_state_from(CursorState::BeginVariant);
    }

    pub fn end_variant(&mut self) {
        self.advance_state_from(CursorState::EndVariant);
    }

    /// Enters an array; the return value reports whether it has zero
    /// elements. An empty array is iterated once to walk the element
    /// *types*; no data is consumed during that walk.
    pub fn begin_array(&mut self) -> bool {
        if self.state != CursorState::BeginArray {
            self.state = CursorState::InvalidData;
            return false;
        }
        self.begin_array_or_dict(false)
    }

    pub fn begin_dict(&mut self) -> bool {
        if self.state != CursorState::BeginDict {
            self.state = CursorState::InvalidData;
            return false;
        }
        self.begin_array_or_dict(true)
    }

    /// Returns `true` to enter the next element, `false` once the array is
    /// exhausted (the state becomes `EndArray`).
    pub fn next_array_entry(&mut self) -> bool {
        if self.state != CursorState::NextArrayEntry {
            self.state = CursorState::InvalidData;
            return false;
        }
        self.next_array_or_dict_entry(false)
    }

    pub fn next_dict_entry(&mut self) -> bool {
        if self.state != CursorState::NextDictEntry {
            self.state = CursorState::InvalidData;
            return false;
        }
        self.next_array_or_dict_entry(true)
    }

    pub fn end_array(&mut self) {
        self.advance_state_from(CursorState::EndArray);
    }

    pub fn end_dict(&mut self) {
        self.advance_state_from(CursorState::EndDict);
    }

    /// Fast path for an array of fixed-size primitives: consumes the whole
    /// array and returns the element state plus the raw element bytes in
    /// host order. Valid only in `BeginArray` state with a fixed-size,
    /// non-boolean element type.
    pub fn read_primitive_array(&mut self) -> (CursorState, Vec<u8>) {
        if self.state != CursorState::BeginArray {
            self.state = CursorState::InvalidData;
            return (CursorState::InvalidData, Vec::new());
        }
        let (contained_type_begin, data_end) = match self.stack.last() {
            Some(&Aggregate::Array {
                is_dict: false,
                contained_type_begin,
                data_end,
            }) => (contained_type_begin, data_end),
            _ => {
                self.state = CursorState::InvalidData;
                return (CursorState::InvalidData, Vec::new());
            }
        };
        let element_char = self.sig_at(contained_type_begin);
        let info = type_info(element_char);
        if !info.is_primitive || element_char == b'b' {
            self.state = CursorState::InvalidData;
            return (CursorState::InvalidData, Vec::new());
        }
        let element_size = info.alignment;
        let mut out = Vec::new();
        if self.zero_length_array_nesting > 0 {
            self.zero_length_array_nesting -= 1;
        } else {
            if (data_end - self.data_pos) % element_size != 0 {
                self.state = CursorState::InvalidData;
                return (CursorState::InvalidData, Vec::new());
            }
            let bytes = &self.data()[self.data_pos..data_end];
            if self.is_swapped() && element_size > 1 {
                out.reserve(bytes.len());
                for element in bytes.chunks(element_size) {
                    out.extend(element.iter().rev());
                }
            } else {
                out.extend_from_slice(bytes);
            }
            self.data_pos = data_end;
        }
        self.stack.pop();
        self.nesting.end_array();
        self.sig_pos = contained_type_begin + 1;
        self.advance_state();
        (info.state, out)
    }

    fn advance_state_from(&mut self, expected: CursorState) {
        if self.state == expected {
            self.advance_state();
        } else {
            self.state = CursorState::InvalidData;
        }
    }

    fn begin_array_or_dict(&mut self, is_dict: bool) -> bool {
        let is_empty = self.zero_length_array_nesting > 0;
        self.state = if is_dict {
            CursorState::NextDictEntry
        } else {
            CursorState::NextArrayEntry
        };
        is_empty
    }

    fn next_array_or_dict_entry(&mut self, is_dict: bool) -> bool {
        let (contained_type_begin, data_end) = match self.stack.last() {
            Some(&Aggregate::Array {
                is_dict: frame_is_dict,
                contained_type_begin,
                data_end,
            }) if frame_is_dict == is_dict => (contained_type_begin, data_end),
            _ => {
                self.state = CursorState::InvalidData;
                return false;
            }
        };

        if self.zero_length_array_nesting > 0 {
            if self.sig_pos <= contained_type_begin {
                // one iteration over the element types, without data
                self.sig_pos = contained_type_begin;
                self.advance_state();
                return self.state != CursorState::InvalidData;
            }
            self.zero_length_array_nesting -= 1;
        } else if self.data_pos < data_end {
            // rewind to the contained type and decode the next element
            if is_dict {
                self.data_pos = align_up(self.data_pos, 8);
            }
            self.sig_pos = contained_type_begin;
            self.advance_state();
            return self.state != CursorState::InvalidData;
        }

        // no more iterations
        self.state = if is_dict {
            CursorState::EndDict
        } else {
            CursorState::EndArray
        };
        if is_dict {
            self.nesting.end_paren();
            self.sig_pos += 1; // skip '}'
        }
        self.nesting.end_array();
        self.stack.pop();
        false
    }

    /// The central state machine step. Consumes one signature character
    /// (or detects the end of an aggregate) and decodes the matching data.
    /// On truncation everything is restored and the state becomes
    /// `NeedMoreData`, unless an open array already promised the bytes.
    fn advance_state(&mut self) {
        if self.state == CursorState::InvalidData {
            return; // nonrecoverable
        }

        let saved_sig_pos = self.sig_pos;
        let saved_data_pos = self.data_pos;

        // end of...
        // - array entry: array on top of the stack and past the element type
        // - dict entry: dict on top of the stack and the current char is '}'
        // - variant: variant on top of the stack, inline signature exhausted
        // - struct: ')' handled through the type table below
        // - argument list: stack empty, signature exhausted
        match self.stack.last().copied() {
            None => {
                if self.sig_pos >= self.sig_len() {
                    self.state = CursorState::Finished;
                    return;
                }
            }
            Some(Aggregate::Struct) => {}
            Some(Aggregate::Variant {
                saved_source,
                saved_pos,
            }) => {
                if self.sig_pos >= self.sig_len() {
                    self.nesting.end_variant();
                    self.sig = saved_source;
                    self.sig_pos = saved_pos;
                    self.stack.pop();
                    self.state = CursorState::EndVariant;
                    return;
                }
            }
            Some(Aggregate::Array {
                is_dict,
                contained_type_begin,
                data_end,
            }) => {
                let is_end_of_entry = if is_dict {
                    self.sig_at(self.sig_pos) == b'}'
                } else {
                    self.sig_pos > contained_type_begin
                };
                if is_end_of_entry {
                    self.state = if is_dict {
                        CursorState::NextDictEntry
                    } else {
                        CursorState::NextArrayEntry
                    };
                    return; // the rest happens in next_array_or_dict_entry()
                }
                if self.zero_length_array_nesting == 0 && self.data_pos >= data_end {
                    // the declared array length ran out mid-element
                    self.state = CursorState::InvalidData;
                    return;
                }
            }
        }

        let letter = self.sig_at(self.sig_pos);
        let info = type_info(letter);
        self.state = info.state;
        if self.state == CursorState::InvalidData {
            return;
        }
        self.sig_pos += 1;

        // in a zero-length array the walk covers only the type shape
        if self.zero_length_array_nesting > 0 && (info.is_primitive || info.is_string_like) {
            self.value = zero_value(self.state);
            return;
        }

        self.data_pos = align_up(self.data_pos, info.alignment);
        let data_len = self.data().len();
        if ((info.is_primitive || info.is_string_like) && self.data_pos + info.alignment > data_len)
            || self.data_pos > data_len
        {
            return self.roll_back(saved_sig_pos, saved_data_pos);
        }

        if info.is_primitive {
            self.state = self.do_read_primitive();
            self.data_pos += info.alignment;
            return;
        }

        if info.is_string_like {
            match self.do_read_string(info.alignment) {
                CursorState::NeedMoreData => self.roll_back(saved_sig_pos, saved_data_pos),
                state => self.state = state,
            }
            return;
        }

        // aggregates
        match self.state {
            CursorState::BeginStruct => {
                if !self.nesting.begin_paren() {
                    self.state = CursorState::InvalidData;
                    return;
                }
                self.stack.push(Aggregate::Struct);
            }
            CursorState::EndStruct => {
                self.nesting.end_paren();
                // the pre-validated signature guarantees a struct on top
                debug_assert!(matches!(self.stack.last(), Some(Aggregate::Struct)));
                self.stack.pop();
            }
            CursorState::BeginVariant => {
                if self.zero_length_array_nesting > 0 {
                    if !self.nesting.begin_variant() {
                        self.state = CursorState::InvalidData;
                        return;
                    }
                    let saved_source = mem::replace(
                        &mut self.sig,
                        SigSource::Inline {
                            start: self.data_pos,
                            len: 0,
                        },
                    );
                    self.stack.push(Aggregate::Variant {
                        saved_source,
                        saved_pos: self.sig_pos,
                    });
                    self.sig_pos = 0;
                    return;
                }
                if self.data_pos >= self.data().len() {
                    return self.roll_back(saved_sig_pos, saved_data_pos);
                }
                let inline_len = self.data()[self.data_pos] as usize;
                let start = self.data_pos + 1;
                let end = start + inline_len + 1; // chars plus NUL
                if end > self.data().len() {
                    return self.roll_back(saved_sig_pos, saved_data_pos);
                }
                // do not clobber nesting before a possible roll back
                if !self.nesting.begin_variant() {
                    self.state = CursorState::InvalidData;
                    return;
                }
                let inline_ok = self.data()[start + inline_len] == 0
                    && is_signature_valid(
                        &self.data()[start..start + inline_len],
                        SignatureType::Variant,
                    );
                if !inline_ok {
                    self.state = CursorState::InvalidData;
                    return;
                }
                self.data_pos = end;
                let saved_source = mem::replace(
                    &mut self.sig,
                    SigSource::Inline {
                        start,
                        len: inline_len,
                    },
                );
                self.stack.push(Aggregate::Variant {
                    saved_source,
                    saved_pos: self.sig_pos,
                });
                self.sig_pos = 0;
            }
            CursorState::BeginArray => {
                let mut array_length = 0u32;
                if self.zero_length_array_nesting == 0 {
                    if self.data_pos + 4 > self.data().len() {
                        return self.roll_back(saved_sig_pos, saved_data_pos);
                    }
                    array_length = basic_io::read_u32(self.data(), self.data_pos, self.is_swapped());
                    if array_length > MAX_ARRAY_LENGTH {
                        self.state = CursorState::InvalidData;
                        return;
                    }
                    self.data_pos += 4;
                }

                let element_char = self.sig_at(self.sig_pos);
                let element_info = type_info(element_char);
                let is_dict = element_char == b'{';
                self.state = if is_dict {
                    CursorState::BeginDict
                } else {
                    CursorState::BeginArray
                };

                if self.zero_length_array_nesting == 0 {
                    self.data_pos = align_up(self.data_pos, element_info.alignment);
                }
                let data_end = self.data_pos + array_length as usize;
                if data_end > self.data().len() {
                    // arrays only start once their data has fully arrived
                    return self.roll_back(saved_sig_pos, saved_data_pos);
                }

                let mut nest_ok = self.nesting.begin_array();
                if is_dict {
                    self.sig_pos += 1; // skip '{'
                    nest_ok = nest_ok && self.nesting.begin_paren();
                }
                if !nest_ok {
                    self.state = CursorState::InvalidData;
                    return;
                }
                if array_length == 0 {
                    self.zero_length_array_nesting += 1;
                }
                self.stack.push(Aggregate::Array {
                    is_dict,
                    contained_type_begin: self.sig_pos,
                    data_end,
                });
            }
            _ => {
                // '}' and stray states cannot appear: the signature is
                // pre-validated and dict frames stop at '}' above
                self.state = CursorState::InvalidData;
            }
        }
    }

    fn roll_back(&mut self, saved_sig_pos: usize, saved_data_pos: usize) {
        // inside an array the length prefix promised us the bytes, so
        // running dry there means the stream is inconsistent
        self.state = if self.nesting.array > 0 {
            CursorState::InvalidData
        } else {
            CursorState::NeedMoreData
        };
        self.sig_pos = saved_sig_pos;
        self.data_pos = saved_data_pos;
    }

    fn do_read_primitive(&mut self) -> CursorState {
        let pos = self.data_pos;
        let swapped = self.is_swapped();
        let value = {
            let data = self.data();
            match self.state {
                CursorState::Byte => Value::Byte(data[pos]),
                CursorState::Boolean => {
                    let num = basic_io::read_u32(data, pos, swapped);
                    if num > 1 {
                        return CursorState::InvalidData;
                    }
                    Value::Boolean(num == 1)
                }
                CursorState::Int16 => Value::Int16(basic_io::read_i16(data, pos, swapped)),
                CursorState::Uint16 => Value::Uint16(basic_io::read_u16(data, pos, swapped)),
                CursorState::Int32 => Value::Int32(basic_io::read_i32(data, pos, swapped)),
                CursorState::Uint32 => Value::Uint32(basic_io::read_u32(data, pos, swapped)),
                CursorState::Int64 => Value::Int64(basic_io::read_i64(data, pos, swapped)),
                CursorState::Uint64 => Value::Uint64(basic_io::read_u64(data, pos, swapped)),
                CursorState::Double => Value::Double(basic_io::read_f64(data, pos, swapped)),
                // the index slot; the fd table is the transport's concern
                CursorState::UnixFd => Value::Uint32(basic_io::read_u32(data, pos, swapped)),
                _ => return CursorState::InvalidData,
            }
        };
        self.value = value;
        self.state
    }

    fn do_read_string(&mut self, length_prefix_size: usize) -> CursorState {
        let content_len = if length_prefix_size == 1 {
            self.data()[self.data_pos] as usize
        } else {
            basic_io::read_u32(self.data(), self.data_pos, self.is_swapped()) as usize
        };
        let start = self.data_pos + length_prefix_size;
        let end = start + content_len + 1; // content plus NUL
        if end > self.data().len() {
            return CursorState::NeedMoreData;
        }
        let text = {
            let data = self.data();
            if data[end - 1] != 0 {
                return CursorState::InvalidData;
            }
            let content = &data[start..start + content_len];
            let content_ok = match self.state {
                CursorState::String => is_string_valid(content),
                CursorState::ObjectPath => is_object_path_valid(content),
                CursorState::Signature => is_signature_valid(content, SignatureType::Full),
                _ => false,
            };
            if !content_ok {
                return CursorState::InvalidData;
            }
            match str::from_utf8(content) {
                Ok(text) => text.to_string(),
                Err(_) => return CursorState::InvalidData,
            }
        };
        self.value = Value::Text(text);
        self.data_pos = end;
        self.state
    }
}

impl<'a> Drop for Reader<'a> {
    fn drop(&mut self) {
        self.args.release_read_claim();
    }
}

/// Placeholder values for the type-shape walk through a zero-length
/// array, chosen so that mirroring them into a writer stays legal.
fn zero_value(state: CursorState) -> Value {
    match state {
        CursorState::Byte => Value::Byte(0),
        CursorState::Boolean => Value::Boolean(false),
        CursorState::Int16 => Value::Int16(0),
        CursorState::Uint16 => Value::Uint16(0),
        CursorState::Int32 => Value::Int32(0),
        CursorState::Uint32 => Value::Uint32(0),
        CursorState::Int64 => Value::Int64(0),
        CursorState::Uint64 => Value::Uint64(0),
        CursorState::Double => Value::Double(0.0),
        CursorState::ObjectPath => Value::Text("/".to_string()),
        CursorState::String | CursorState::Signature => Value::Text(String::new()),
        CursorState::UnixFd => Value::Uint32(0),
        _ => Value::None,
    }
}
