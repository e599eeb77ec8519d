//! The encoding cursor. Caller-facing operations append signature
//! characters and record data into an append-only element log; `finish()`
//! replays that log once to materialise the payload with final alignment,
//! back-patched array lengths and inlined variant signatures.

use std::mem;

use crate::basic_io::{self, align_up};
use crate::signature::{
    is_object_path_valid, is_signature_valid, is_string_valid, type_info, Nesting, SignatureType,
    MAX_ARRAY_LENGTH, MAX_SIGNATURE_LENGTH,
};
use crate::{Arguments, CursorState};

/// One entry of the element log: an alignment and either a byte count to
/// copy from the scratch buffer or one of the three sentinels.
#[derive(Clone, Copy, Debug)]
struct ElementInfo {
    alignment: u8,
    size: u8,
}

impl ElementInfo {
    const LARGEST_SIZE: u8 = 60;
    /// Reserve a 4-byte array length slot, to be patched later.
    const ARRAY_LENGTH_FIELD: u8 = 61;
    /// Close the innermost open length slot with the accumulated count.
    const ARRAY_LENGTH_END_MARK: u8 = 62;
    /// Splice in the next completed variant signature.
    const VARIANT_SIGNATURE: u8 = 63;

    fn new(alignment: usize, size: u8) -> ElementInfo {
        ElementInfo {
            alignment: alignment as u8,
            size,
        }
    }
}

/// Which signature buffer the cursor currently appends to: the argument
/// list signature or the inline signature of an open variant.
#[derive(Clone, Copy, Debug)]
enum SigBuf {
    Main,
    Variant(usize),
}

#[derive(Clone, Copy, Debug)]
enum Aggregate {
    Struct {
        contained_type_begin: usize,
    },
    Variant {
        saved: SigBuf,
        saved_pos: usize,
        slot: usize,
        emit: bool,
    },
    Array {
        is_dict: bool,
        contained_type_begin: usize,
    },
}

struct ArrayLengthField {
    length_field_position: usize,
    data_start_position: usize,
}

/// Encoding cursor producing one `Arguments` value.
///
/// All operations are self-validating: any grammar violation moves the
/// cursor to the sticky `InvalidData` state, and `finish()` then yields a
/// value with empty signature and empty data.
pub struct Writer<'a> {
    args: &'a Arguments,
    state: CursorState,
    finished: bool,
    nesting: Nesting,
    signature: Vec<u8>,
    current_sig: SigBuf,
    sig_pos: usize,
    data: Vec<u8>,
    elements: Vec<ElementInfo>,
    variant_signatures: Vec<Vec<u8>>,
    stack: Vec<Aggregate>,
    zero_length_array_nesting: u32,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(args: &'a Arguments) -> Writer<'a> {
        Writer {
            args,
            state: CursorState::AnyData,
            finished: false,
            nesting: Nesting::new(),
            signature: Vec::with_capacity(MAX_SIGNATURE_LENGTH + 1),
            current_sig: SigBuf::Main,
            sig_pos: 0,
            data: Vec::with_capacity(16 * 1024),
            elements: Vec::new(),
            variant_signatures: Vec::new(),
            stack: Vec::new(),
            zero_length_array_nesting: 0,
        }
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// The kinds of the currently open aggregates, outermost first.
    pub fn aggregate_stack(&self) -> Vec<CursorState> {
        self.stack
            .iter()
            .map(|frame| match *frame {
                Aggregate::Struct { .. } => CursorState::BeginStruct,
                Aggregate::Variant { .. } => CursorState::BeginVariant,
                Aggregate::Array { is_dict: false, .. } => CursorState::BeginArray,
                Aggregate::Array { is_dict: true, .. } => CursorState::BeginDict,
            })
            .collect()
    }

    pub fn write_byte(&mut self, value: u8) {
        self.write_fixed(b"y", CursorState::Byte, &[value]);
    }

    /// Booleans occupy four bytes on the wire, carrying 0 or 1.
    pub fn write_boolean(&mut self, value: bool) {
        let num: u32 = if value { 1 } else { 0 };
        self.write_fixed(b"b", CursorState::Boolean, &num.to_ne_bytes());
    }

    pub fn write_int16(&mut self, value: i16) {
        self.write_fixed(b"n", CursorState::Int16, &value.to_ne_bytes());
    }

    pub fn write_uint16(&mut self, value: u16) {
        self.write_fixed(b"q", CursorState::Uint16, &value.to_ne_bytes());
    }

    pub fn write_int32(&mut self, value: i32) {
        self.write_fixed(b"i", CursorState::Int32, &value.to_ne_bytes());
    }

    pub fn write_uint32(&mut self, value: u32) {
        self.write_fixed(b"u", CursorState::Uint32, &value.to_ne_bytes());
    }

    pub fn write_int64(&mut self, value: i64) {
        self.write_fixed(b"x", CursorState::Int64, &value.to_ne_bytes());
    }

    pub fn write_uint64(&mut self, value: u64) {
        self.write_fixed(b"t", CursorState::Uint64, &value.to_ne_bytes());
    }

    pub fn write_double(&mut self, value: f64) {
        self.write_fixed(b"d", CursorState::Double, &value.to_ne_bytes());
    }

    /// Writes the 4-byte index slot of an `h` argument; the matching file
    /// descriptor table entry is the transport's concern.
    pub fn write_unix_fd(&mut self, index: u32) {
        self.write_fixed(b"h", CursorState::UnixFd, &index.to_ne_bytes());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_string_like(b"s", CursorState::String, value);
    }

    pub fn write_object_path(&mut self, value: &str) {
        self.write_string_like(b"o", CursorState::ObjectPath, value);
    }

    pub fn write_signature(&mut self, value: &str) {
        self.write_string_like(b"g", CursorState::Signature, value);
    }

    pub fn begin_struct(&mut self) {
        self.advance_state(b"(", CursorState::BeginStruct);
    }

    pub fn end_struct(&mut self) {
        self.advance_state(b")", CursorState::EndStruct);
    }

    pub fn begin_variant(&mut self) {
        self.advance_state(b"v", CursorState::BeginVariant);
    }

    pub fn end_variant(&mut self) {
        self.advance_state(b"", CursorState::EndVariant);
    }

    /// Opens an array. An empty array still records the element type:
    /// walk it exactly once, writing placeholder values; none of them
    /// reach the output.
    pub fn begin_array(&mut self, is_empty: bool) {
        self.begin_array_or_dict(false, is_empty);
    }

    pub fn begin_dict(&mut self, is_empty: bool) {
        self.begin_array_or_dict(true, is_empty);
    }

    /// Optional before the first entry; required between entries.
    pub fn next_array_entry(&mut self) {
        self.next_array_or_dict_entry(false);
    }

    pub fn next_dict_entry(&mut self) {
        self.next_array_or_dict_entry(true);
    }

    pub fn end_array(&mut self) {
        self.advance_state(b"", CursorState::EndArray);
    }

    pub fn end_dict(&mut self) {
        self.advance_state(b"}", CursorState::EndDict);
    }

    /// Fast path for an array of fixed-size primitives: emits the type,
    /// the length prefix and the payload in one go. `data` holds the raw
    /// elements in host order; its length must be a multiple of the
    /// element size.
    pub fn write_primitive_array(&mut self, element: CursorState, data: &[u8]) {
        if self.state == CursorState::InvalidData || self.finished {
            return;
        }
        let (letter, element_size) = match element {
            CursorState::Byte => (b'y', 1usize),
            CursorState::Int16 => (b'n', 2),
            CursorState::Uint16 => (b'q', 2),
            CursorState::Int32 => (b'i', 4),
            CursorState::Uint32 => (b'u', 4),
            CursorState::Int64 => (b'x', 8),
            CursorState::Uint64 => (b't', 8),
            CursorState::Double => (b'd', 8),
            CursorState::UnixFd => (b'h', 4),
            _ => {
                self.state = CursorState::InvalidData;
                return;
            }
        };
        if data.len() % element_size != 0 || data.len() > MAX_ARRAY_LENGTH as usize {
            self.state = CursorState::InvalidData;
            return;
        }
        if self.zero_length_array_nesting > 0 && !data.is_empty() {
            self.state = CursorState::InvalidData;
            return;
        }
        self.state = CursorState::BeginArray;
        let fragment = [b'a', letter];
        if !self.update_signature(&fragment, CursorState::BeginArray, false, false) {
            return;
        }
        if !self.nesting.begin_array() {
            self.state = CursorState::InvalidData;
            return;
        }
        self.nesting.end_array();
        if self.zero_length_array_nesting == 0 {
            self.elements
                .push(ElementInfo::new(4, ElementInfo::ARRAY_LENGTH_FIELD));
            let mut rest = data;
            let mut alignment = element_size;
            while !rest.is_empty() {
                let take = rest.len().min(ElementInfo::LARGEST_SIZE as usize);
                self.push_chunk(alignment, &rest[..take]);
                alignment = 1;
                rest = &rest[take..];
            }
            self.elements.push(ElementInfo::new(
                element_size,
                ElementInfo::ARRAY_LENGTH_END_MARK,
            ));
        }
        self.state = CursorState::AnyData;
    }

    /// Materialises the payload and returns the finished value. Requires
    /// every aggregate to be closed; afterwards the cursor is inert.
    pub fn finish(&mut self) -> Arguments {
        if self.state == CursorState::InvalidData
            || self.finished
            || !self.stack.is_empty()
            || self.zero_length_array_nesting != 0
        {
            self.state = CursorState::InvalidData;
            return Arguments::default();
        }
        debug_assert_eq!(self.sig_pos, self.signature.len());

        let mut out: Vec<u8> = Vec::with_capacity(self.data.len() + 16);
        let mut scratch_pos = 0usize;
        let mut variant_index = 0usize;
        let mut length_field_stack: Vec<ArrayLengthField> = Vec::new();

        for i in 0..self.elements.len() {
            let element = self.elements[i];
            match element.size {
                ElementInfo::ARRAY_LENGTH_FIELD => {
                    out.resize(align_up(out.len(), 4), 0);
                    let length_field_position = out.len();
                    out.extend_from_slice(&[0u8; 4]);
                    // array data starts aligned to the first element
                    let next_alignment = self.elements[i + 1].alignment as usize;
                    out.resize(align_up(out.len(), next_alignment), 0);
                    length_field_stack.push(ArrayLengthField {
                        length_field_position,
                        data_start_position: out.len(),
                    });
                }
                ElementInfo::ARRAY_LENGTH_END_MARK => match length_field_stack.pop() {
                    Some(field) => {
                        let length = (out.len() - field.data_start_position) as u32;
                        basic_io::patch_u32(&mut out, field.length_field_position, length);
                    }
                    None => {
                        self.state = CursorState::InvalidData;
                        return Arguments::default();
                    }
                },
                ElementInfo::VARIANT_SIGNATURE => {
                    // length prefix, characters, NUL
                    let signature = &self.variant_signatures[variant_index];
                    variant_index += 1;
                    out.push(signature.len() as u8);
                    out.extend_from_slice(signature);
                    out.push(0);
                }
                size => {
                    let alignment = element.alignment as usize;
                    out.resize(align_up(out.len(), alignment), 0); // zero-filled padding
                    scratch_pos = align_up(scratch_pos, alignment);
                    out.extend_from_slice(&self.data[scratch_pos..scratch_pos + size as usize]);
                    scratch_pos += size as usize;
                }
            }
        }
        debug_assert_eq!(variant_index, self.variant_signatures.len());
        debug_assert!(length_field_stack.is_empty());

        self.elements.clear();
        self.variant_signatures.clear();
        self.finished = true;
        self.state = CursorState::Finished;
        Arguments::new(mem::replace(&mut self.signature, Vec::new()), out, false)
    }

    fn sig(&self) -> &[u8] {
        match self.current_sig {
            SigBuf::Main => &self.signature,
            SigBuf::Variant(slot) => &self.variant_signatures[slot],
        }
    }

    fn sig_mut(&mut self) -> &mut Vec<u8> {
        match self.current_sig {
            SigBuf::Main => &mut self.signature,
            SigBuf::Variant(slot) => &mut self.variant_signatures[slot],
        }
    }

    fn invalidate(&mut self) -> bool {
        self.state = CursorState::InvalidData;
        false
    }

    /// Appends one scratch chunk, replaying the alignment the final pass
    /// will apply, and logs it.
    fn push_chunk(&mut self, alignment: usize, bytes: &[u8]) {
        debug_assert!(bytes.len() <= ElementInfo::LARGEST_SIZE as usize);
        let aligned = align_up(self.data.len(), alignment);
        self.data.resize(aligned, 0);
        self.data.extend_from_slice(bytes);
        self.elements
            .push(ElementInfo::new(alignment, bytes.len() as u8));
    }

    fn write_fixed(&mut self, fragment: &[u8], state: CursorState, bytes: &[u8]) {
        if !self.advance_state(fragment, state) {
            return;
        }
        if self.zero_length_array_nesting > 0 {
            return; // type walk of an empty array, no data recorded
        }
        self.push_chunk(bytes.len(), bytes);
    }

    fn write_string_like(&mut self, fragment: &[u8], state: CursorState, value: &str) {
        if !self.advance_state(fragment, state) {
            return;
        }
        let content_ok = match state {
            CursorState::String => is_string_valid(value.as_bytes()),
            CursorState::ObjectPath => is_object_path_valid(value.as_bytes()),
            CursorState::Signature => is_signature_valid(value.as_bytes(), SignatureType::Full),
            _ => false,
        };
        if !content_ok {
            self.state = CursorState::InvalidData;
            return;
        }
        if self.zero_length_array_nesting > 0 {
            return;
        }
        let length_prefix_size = if state == CursorState::Signature { 1 } else { 4 };
        if length_prefix_size == 1 {
            self.push_chunk(1, &[value.len() as u8]);
        } else {
            self.push_chunk(4, &(value.len() as u32).to_ne_bytes());
        }
        // content plus terminating NUL, chunked to fit the log's size field
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        let mut rest = &bytes[..];
        while !rest.is_empty() {
            let take = rest.len().min(ElementInfo::LARGEST_SIZE as usize);
            self.push_chunk(1, &rest[..take]);
            rest = &rest[take..];
        }
    }

    fn begin_array_or_dict(&mut self, is_dict: bool, is_empty: bool) {
        if self.state == CursorState::InvalidData || self.finished {
            return;
        }
        // during the type walk of an empty container, nested containers
        // must be empty as well
        if self.zero_length_array_nesting > 0 && !is_empty {
            self.state = CursorState::InvalidData;
            return;
        }
        if is_dict {
            self.advance_state(b"a{", CursorState::BeginDict);
        } else {
            self.advance_state(b"a", CursorState::BeginArray);
        }
        if is_empty && self.state != CursorState::InvalidData {
            self.zero_length_array_nesting += 1;
        }
    }

    fn next_array_or_dict_entry(&mut self, is_dict: bool) {
        if self.state == CursorState::InvalidData || self.finished {
            return;
        }
        let contained_type_begin = match self.stack.last() {
            Some(&Aggregate::Array {
                is_dict: frame_is_dict,
                contained_type_begin,
            }) if frame_is_dict == is_dict => contained_type_begin,
            _ => {
                self.state = CursorState::InvalidData;
                return;
            }
        };
        if self.zero_length_array_nesting > 0 {
            // a single iteration writes the types
            if self.sig_pos != contained_type_begin {
                self.state = CursorState::InvalidData;
            }
        } else if self.sig_pos == contained_type_begin {
            // before the first entry this call is a no-op
        } else {
            if is_dict && self.sig_pos < contained_type_begin + 2 {
                // an entry carries a key and a value
                self.state = CursorState::InvalidData;
                return;
            }
            self.sig_pos = contained_type_begin;
            if is_dict {
                self.push_chunk(8, &[]); // entries are 8-aligned
            }
        }
    }

    /// Phase one of every operation: extend the signature (first pass) or
    /// match it (repeat array iterations), enforcing the aggregate rules.
    fn update_signature(
        &mut self,
        fragment: &[u8],
        new_state: CursorState,
        is_primitive: bool,
        is_string_like: bool,
    ) -> bool {
        let is_writing = self.sig_pos == self.sig().len();
        if is_writing {
            if self.sig_pos + fragment.len() > MAX_SIGNATURE_LENGTH {
                return self.invalidate();
            }
            if let Some(&frame) = self.stack.last() {
                match frame {
                    Aggregate::Variant { .. } => {
                        // a variant holds exactly one complete type
                        if self.sig_pos >= 1 && new_state != CursorState::EndVariant {
                            return self.invalidate();
                        }
                    }
                    Aggregate::Array {
                        is_dict: false,
                        contained_type_begin,
                    } => {
                        if self.sig_pos >= contained_type_begin + 1
                            && new_state != CursorState::EndArray
                        {
                            return self.invalidate();
                        }
                    }
                    Aggregate::Array {
                        is_dict: true,
                        contained_type_begin,
                    } => {
                        // basic key, one value type, then only '}'
                        if self.sig_pos == contained_type_begin
                            && !(is_primitive || is_string_like)
                        {
                            return self.invalidate();
                        }
                        if self.sig_pos >= contained_type_begin + 2
                            && new_state != CursorState::EndDict
                        {
                            return self.invalidate();
                        }
                    }
                    Aggregate::Struct { .. } => {}
                }
            }
            self.sig_mut().extend_from_slice(fragment);
            self.sig_pos += fragment.len();
        } else {
            // repeat iterations must match the recorded element signature
            if self.sig_pos + fragment.len() > self.sig().len() {
                return self.invalidate();
            }
            for &c in fragment {
                if self.sig()[self.sig_pos] != c {
                    return self.invalidate();
                }
                self.sig_pos += 1;
            }
        }
        true
    }

    /// Phase two dispatch: returns `true` when the caller should record
    /// primitive or string data; aggregate bookkeeping happens here.
    fn advance_state(&mut self, fragment: &[u8], new_state: CursorState) -> bool {
        if self.state == CursorState::InvalidData || self.finished {
            return false;
        }
        self.state = new_state;

        let (is_primitive, is_string_like) = match fragment.first() {
            Some(&c) => {
                let info = type_info(c);
                (info.is_primitive, info.is_string_like)
            }
            None => (false, false),
        };

        if !self.update_signature(fragment, new_state, is_primitive, is_string_like) {
            return false;
        }

        if is_primitive || is_string_like {
            return true;
        }

        match new_state {
            CursorState::BeginStruct => {
                if !self.nesting.begin_paren() {
                    return self.invalidate();
                }
                self.stack.push(Aggregate::Struct {
                    contained_type_begin: self.sig_pos,
                });
                if self.zero_length_array_nesting == 0 {
                    self.push_chunk(8, &[]); // alignment only
                }
            }
            CursorState::EndStruct => {
                self.nesting.end_paren();
                match self.stack.pop() {
                    Some(Aggregate::Struct {
                        contained_type_begin,
                    }) => {
                        // no empty structs
                        if self.sig_pos <= contained_type_begin + 1 {
                            return self.invalidate();
                        }
                    }
                    _ => return self.invalidate(),
                }
            }
            CursorState::BeginVariant => {
                if !self.nesting.begin_variant() {
                    return self.invalidate();
                }
                let emit = self.zero_length_array_nesting == 0;
                if emit {
                    // finish() takes the completed signature from the table
                    self.elements
                        .push(ElementInfo::new(1, ElementInfo::VARIANT_SIGNATURE));
                }
                self.variant_signatures.push(Vec::new());
                let slot = self.variant_signatures.len() - 1;
                let saved = mem::replace(&mut self.current_sig, SigBuf::Variant(slot));
                self.stack.push(Aggregate::Variant {
                    saved,
                    saved_pos: self.sig_pos,
                    slot,
                    emit,
                });
                self.sig_pos = 0;
            }
            CursorState::EndVariant => {
                self.nesting.end_variant();
                match self.stack.pop() {
                    Some(Aggregate::Variant {
                        saved,
                        saved_pos,
                        slot,
                        emit,
                    }) => {
                        // an empty variant is only legal inside the type
                        // walk of an empty array
                        if self.zero_length_array_nesting == 0 && self.sig_pos == 0 {
                            return self.invalidate();
                        }
                        if !emit {
                            debug_assert_eq!(slot + 1, self.variant_signatures.len());
                            let _ = self.variant_signatures.pop();
                        }
                        self.current_sig = saved;
                        self.sig_pos = saved_pos;
                    }
                    _ => return self.invalidate(),
                }
            }
            CursorState::BeginArray | CursorState::BeginDict => {
                let is_dict = new_state == CursorState::BeginDict;
                let mut nest_ok = self.nesting.begin_array();
                if is_dict {
                    nest_ok = nest_ok && self.nesting.begin_paren();
                }
                if !nest_ok {
                    return self.invalidate();
                }
                self.stack.push(Aggregate::Array {
                    is_dict,
                    contained_type_begin: self.sig_pos,
                });
                if self.zero_length_array_nesting == 0 {
                    self.elements
                        .push(ElementInfo::new(4, ElementInfo::ARRAY_LENGTH_FIELD));
                    if is_dict {
                        self.push_chunk(8, &[]); // entries are 8-aligned
                    }
                }
                if is_dict {
                    self.state = CursorState::DictKey;
                    return false;
                }
            }
            CursorState::EndArray | CursorState::EndDict => {
                let is_dict = new_state == CursorState::EndDict;
                if is_dict {
                    self.nesting.end_paren();
                }
                self.nesting.end_array();
                match self.stack.pop() {
                    Some(Aggregate::Array {
                        is_dict: frame_is_dict,
                        contained_type_begin,
                    }) if frame_is_dict == is_dict => {
                        let minimum = if is_dict {
                            contained_type_begin + 3 // key, value, '}'
                        } else {
                            contained_type_begin + 1 // one complete type
                        };
                        if self.sig_pos < minimum {
                            return self.invalidate();
                        }
                        // the mark carries the element alignment so that an
                        // empty array still pads up to its first element
                        let mark_alignment = if is_dict {
                            8
                        } else {
                            type_info(self.sig()[contained_type_begin]).alignment
                        };
                        if self.zero_length_array_nesting > 0 {
                            self.zero_length_array_nesting -= 1;
                            if self.zero_length_array_nesting == 0 {
                                self.elements.push(ElementInfo::new(
                                    mark_alignment,
                                    ElementInfo::ARRAY_LENGTH_END_MARK,
                                ));
                            }
                        } else {
                            self.elements.push(ElementInfo::new(
                                mark_alignment,
                                ElementInfo::ARRAY_LENGTH_END_MARK,
                            ));
                        }
                    }
                    _ => return self.invalidate(),
                }
            }
            _ => return self.invalidate(),
        }
        self.state = CursorState::AnyData;
        false
    }
}

impl<'a> Drop for Writer<'a> {
    fn drop(&mut self) {
        self.args.release_write_claim();
    }
}
