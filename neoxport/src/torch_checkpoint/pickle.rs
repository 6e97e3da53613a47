//! A stack machine for the part of the pickle protocol that `torch.save`
//! uses for a `state_dict`.
//!
//! Only the objects needed to find tensors are modelled. Everything else
//! (hooks, metadata, flags) becomes [`Object::Opaque`] or an empty container
//! marker and is dropped.

use std::collections::HashMap;

use thiserror::Error;

use super::{TorchStateDict, TorchTensorSpec};
use crate::DataType;

mod op {
    pub const PROTO: u8 = 0x80;
    pub const FRAME: u8 = 0x95;
    pub const STOP: u8 = b'.';

    pub const GLOBAL: u8 = b'c';
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const REDUCE: u8 = b'R';
    pub const BUILD: u8 = b'b';
    pub const BINPERSID: u8 = b'Q';

    pub const MARK: u8 = b'(';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const EMPTY_LIST: u8 = b']';
    pub const EMPTY_DICT: u8 = b'}';
    pub const TUPLE: u8 = b't';
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const SETITEM: u8 = b's';
    pub const SETITEMS: u8 = b'u';
    pub const APPEND: u8 = b'a';
    pub const APPENDS: u8 = b'e';

    pub const NONE: u8 = b'N';
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const LONG1: u8 = 0x8a;
    pub const BINFLOAT: u8 = b'G';
    pub const BINUNICODE: u8 = b'X';
    pub const SHORT_BINUNICODE: u8 = 0x8c;

    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const MEMOIZE: u8 = 0x94;
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
}

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("unexpected end of stream at byte {0}")]
    UnexpectedEof(usize),
    #[error("unsupported opcode 0x{opcode:02x} at byte {offset}")]
    UnsupportedOpcode {
        opcode: u8,
        offset: usize,
    },
    #[error("{0} without a preceding MARK")]
    MissingMark(&'static str),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("memo slot {0} is empty")]
    MissingMemo(usize),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("LONG1 of {0} bytes does not fit in 64 bits")]
    LongTooWide(usize),
    #[error("cannot call {0}")]
    UnsupportedCallable(String),
    #[error("unsupported storage type {0}")]
    UnsupportedStorage(String),
    #[error("{0}")]
    Malformed(String),
}

fn malformed(message: impl Into<String>) -> PickleError {
    PickleError::Malformed(message.into())
}

/// Maps a `torch.*Storage` class to the element type it holds.
pub fn storage_data_type(
    module: &str,
    name: &str,
) -> Option<DataType> {
    if module != "torch" {
        return None;
    }
    Some(match name {
        "FloatStorage" => DataType::F32,
        "HalfStorage" => DataType::F16,
        "BFloat16Storage" => DataType::BF16,
        "DoubleStorage" => DataType::F64,
        "LongStorage" => DataType::I64,
        "IntStorage" => DataType::I32,
        "ShortStorage" => DataType::I16,
        "CharStorage" => DataType::I8,
        "ByteStorage" => DataType::U8,
        "BoolStorage" => DataType::Bool,
        _ => return None,
    })
}

/// Runs `bytes` and returns the tensors of the state dict in insertion order.
pub fn load_state_dict(bytes: &[u8]) -> Result<TorchStateDict, PickleError> {
    Unpickler::new(bytes).run()
}

#[derive(Debug, Clone)]
enum Object {
    Opaque,
    Int(i64),
    Str(String),
    Tuple(Vec<Object>),
    List,
    Dict,
    /// The first dict the stream builds; its tensor entries are recorded.
    StateDict,
    Global {
        module: String,
        name: String,
    },
    Storage {
        dtype: DataType,
        key: String,
    },
    Tensor(TorchTensorSpec),
}

impl Object {
    fn into_usize(self) -> Result<usize, PickleError> {
        match self {
            Object::Int(value) => usize::try_from(value).map_err(|_| malformed(format!("negative size {value}"))),
            _ => Err(malformed("expected an integer")),
        }
    }

    fn into_usizes(self) -> Result<Box<[usize]>, PickleError> {
        match self {
            Object::Tuple(items) => items.into_iter().map(Object::into_usize).collect(),
            _ => Err(malformed("expected a tuple of integers")),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(
        &mut self,
        len: usize,
    ) -> Result<&'a [u8], PickleError> {
        let bytes: &'a [u8] = self.bytes;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= bytes.len())
            .ok_or(PickleError::UnexpectedEof(bytes.len()))?;
        let slice = &bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    /// Little-endian two's complement integer of `len` bytes.
    fn long(
        &mut self,
        len: usize,
    ) -> Result<i64, PickleError> {
        if len > 8 {
            return Err(PickleError::LongTooWide(len));
        }
        let bytes = self.take(len)?;
        let negative = bytes.last().is_some_and(|&b| b & 0x80 != 0);
        let mut out = [if negative { 0xff } else { 0 }; 8];
        out[..len].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(out))
    }

    fn text(
        &mut self,
        len: usize,
    ) -> Result<String, PickleError> {
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| PickleError::InvalidUtf8)
    }

    fn line(&mut self) -> Result<String, PickleError> {
        let bytes: &'a [u8] = self.bytes;
        let rest = &bytes[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(PickleError::UnexpectedEof(bytes.len()))?;
        let line = self.text(len)?;
        self.pos += 1;
        Ok(line)
    }
}

struct Unpickler<'a> {
    cursor: Cursor<'a>,
    stack: Vec<Object>,
    marks: Vec<usize>,
    memo: HashMap<usize, Object>,
    state_dict_created: bool,
    tensors: TorchStateDict,
}

impl<'a> Unpickler<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor {
                bytes,
                pos: 0,
            },
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
            state_dict_created: false,
            tensors: TorchStateDict::new(),
        }
    }

    fn run(mut self) -> Result<TorchStateDict, PickleError> {
        loop {
            let offset = self.cursor.pos;
            let opcode = self.cursor.byte()?;
            match opcode {
                op::PROTO => {
                    self.cursor.byte()?;
                },
                op::FRAME => {
                    self.cursor.array::<8>()?;
                },
                op::STOP => return Ok(self.tensors),

                op::GLOBAL => {
                    let module = self.cursor.line()?;
                    let name = self.cursor.line()?;
                    self.stack.push(Object::Global {
                        module,
                        name,
                    });
                },
                op::STACK_GLOBAL => {
                    let name = self.pop_str()?;
                    let module = self.pop_str()?;
                    self.stack.push(Object::Global {
                        module,
                        name,
                    });
                },
                op::REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let object = self.call(callable, args)?;
                    self.stack.push(object);
                },
                op::BUILD => {
                    // The instance stays; its state is not needed.
                    self.pop()?;
                },
                op::BINPERSID => {
                    let pid = self.pop()?;
                    self.stack.push(persistent_storage(pid)?);
                },

                op::MARK => self.marks.push(self.stack.len()),
                op::EMPTY_TUPLE => self.stack.push(Object::Tuple(Vec::new())),
                op::EMPTY_LIST => self.stack.push(Object::List),
                op::EMPTY_DICT => {
                    let dict = self.new_dict();
                    self.stack.push(dict);
                },
                op::TUPLE => {
                    let items = self.pop_to_mark("TUPLE")?;
                    self.stack.push(Object::Tuple(items));
                },
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let len = usize::from(opcode - op::TUPLE1) + 1;
                    let split = self.stack.len().checked_sub(len).ok_or(PickleError::StackUnderflow)?;
                    let items = self.stack.split_off(split);
                    self.stack.push(Object::Tuple(items));
                },
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                },
                op::SETITEMS => {
                    let items = self.pop_to_mark("SETITEMS")?;
                    self.set_items(items)?;
                },
                op::APPEND => {
                    self.pop()?;
                    self.expect_list()?;
                },
                op::APPENDS => {
                    self.pop_to_mark("APPENDS")?;
                    self.expect_list()?;
                },

                op::NONE | op::NEWTRUE | op::NEWFALSE => self.stack.push(Object::Opaque),
                op::BINFLOAT => {
                    self.cursor.array::<8>()?;
                    self.stack.push(Object::Opaque);
                },
                op::BININT => {
                    let value = i32::from_le_bytes(self.cursor.array()?);
                    self.stack.push(Object::Int(value.into()));
                },
                op::BININT1 => {
                    let value = self.cursor.byte()?;
                    self.stack.push(Object::Int(value.into()));
                },
                op::BININT2 => {
                    let value = u16::from_le_bytes(self.cursor.array()?);
                    self.stack.push(Object::Int(value.into()));
                },
                op::LONG1 => {
                    let len = self.cursor.byte()?;
                    let value = self.cursor.long(len.into())?;
                    self.stack.push(Object::Int(value));
                },
                op::BINUNICODE => {
                    let len = u32::from_le_bytes(self.cursor.array()?) as usize;
                    let text = self.cursor.text(len)?;
                    self.stack.push(Object::Str(text));
                },
                op::SHORT_BINUNICODE => {
                    let len = self.cursor.byte()?;
                    let text = self.cursor.text(len.into())?;
                    self.stack.push(Object::Str(text));
                },

                op::BINPUT => {
                    let slot = self.cursor.byte()?.into();
                    self.memoize(slot)?;
                },
                op::LONG_BINPUT => {
                    let slot = u32::from_le_bytes(self.cursor.array()?) as usize;
                    self.memoize(slot)?;
                },
                op::MEMOIZE => self.memoize(self.memo.len())?,
                op::BINGET => {
                    let slot = self.cursor.byte()?.into();
                    self.recall(slot)?;
                },
                op::LONG_BINGET => {
                    let slot = u32::from_le_bytes(self.cursor.array()?) as usize;
                    self.recall(slot)?;
                },

                _ => {
                    return Err(PickleError::UnsupportedOpcode {
                        opcode,
                        offset,
                    });
                },
            }
        }
    }

    fn new_dict(&mut self) -> Object {
        if self.state_dict_created {
            Object::Dict
        } else {
            self.state_dict_created = true;
            Object::StateDict
        }
    }

    fn call(
        &mut self,
        callable: Object,
        args: Object,
    ) -> Result<Object, PickleError> {
        let Object::Global {
            module,
            name,
        } = callable
        else {
            return Err(malformed("REDUCE of a non-global callable"));
        };
        let Object::Tuple(args) = args else {
            return Err(malformed("REDUCE arguments are not a tuple"));
        };

        match (module.as_str(), name.as_str()) {
            ("collections", "OrderedDict") => Ok(self.new_dict()),
            ("torch._utils", "_rebuild_tensor_v2") => rebuild_tensor(args).map(Object::Tensor),
            _ => Err(PickleError::UnsupportedCallable(format!("{module}.{name}"))),
        }
    }

    fn set_items(
        &mut self,
        items: Vec<Object>,
    ) -> Result<(), PickleError> {
        if items.len() % 2 != 0 {
            return Err(malformed("odd number of dict items"));
        }
        match self.stack.last() {
            Some(Object::StateDict) => {
                let mut items = items.into_iter();
                while let (Some(key), Some(value)) = (items.next(), items.next()) {
                    if let (Object::Str(key), Object::Tensor(spec)) = (key, value) {
                        self.tensors.insert(key, spec);
                    }
                }
                Ok(())
            },
            Some(Object::Dict) => Ok(()),
            _ => Err(malformed("dict items set on a non-dict")),
        }
    }

    fn expect_list(&self) -> Result<(), PickleError> {
        match self.stack.last() {
            Some(Object::List) => Ok(()),
            _ => Err(malformed("list items appended to a non-list")),
        }
    }

    fn memoize(
        &mut self,
        slot: usize,
    ) -> Result<(), PickleError> {
        let top = self.stack.last().cloned().ok_or(PickleError::StackUnderflow)?;
        self.memo.insert(slot, top);
        Ok(())
    }

    fn recall(
        &mut self,
        slot: usize,
    ) -> Result<(), PickleError> {
        let object = self.memo.get(&slot).cloned().ok_or(PickleError::MissingMemo(slot))?;
        self.stack.push(object);
        Ok(())
    }

    fn pop(&mut self) -> Result<Object, PickleError> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn pop_str(&mut self) -> Result<String, PickleError> {
        match self.pop()? {
            Object::Str(text) => Ok(text),
            _ => Err(malformed("expected a string")),
        }
    }

    fn pop_to_mark(
        &mut self,
        opcode: &'static str,
    ) -> Result<Vec<Object>, PickleError> {
        let mark = self.marks.pop().ok_or(PickleError::MissingMark(opcode))?;
        if mark > self.stack.len() {
            return Err(PickleError::StackUnderflow);
        }
        Ok(self.stack.split_off(mark))
    }
}

/// `('storage', torch.XStorage, key, location, numel)`
fn persistent_storage(pid: Object) -> Result<Object, PickleError> {
    let Object::Tuple(fields) = pid else {
        return Err(malformed("persistent id is not a tuple"));
    };
    match fields.as_slice() {
        [
            Object::Str(kind),
            Object::Global {
                module,
                name,
            },
            Object::Str(key),
            _,
            _,
        ] if kind == "storage" => {
            let dtype = storage_data_type(module, name)
                .ok_or_else(|| PickleError::UnsupportedStorage(format!("{module}.{name}")))?;
            Ok(Object::Storage {
                dtype,
                key: key.clone(),
            })
        },
        _ => Err(malformed("persistent id is not a ('storage', type, key, location, numel) tuple")),
    }
}

/// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks[, metadata])`
fn rebuild_tensor(args: Vec<Object>) -> Result<TorchTensorSpec, PickleError> {
    if !(6..=7).contains(&args.len()) {
        return Err(malformed(format!("_rebuild_tensor_v2 takes 6 or 7 arguments, got {}", args.len())));
    }
    let mut args = args.into_iter();
    let Some(Object::Storage {
        dtype,
        key,
    }) = args.next()
    else {
        return Err(malformed("_rebuild_tensor_v2 expects a storage first"));
    };
    let mut next = || args.next().ok_or(PickleError::StackUnderflow);
    let storage_offset_elems = next()?.into_usize()?;
    let shape = next()?.into_usizes()?;
    let stride = next()?.into_usizes()?;

    Ok(TorchTensorSpec {
        dtype,
        shape,
        stride,
        storage_key: key,
        storage_offset_elems,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ordered_dict() {
        let pkl = b"\x80\x02ccollections\nOrderedDict\nq\x00)Rq\x01.";
        assert!(load_state_dict(pkl).unwrap().is_empty());
    }

    #[test]
    fn tensor_entry_is_recorded() {
        let mut pkl = b"\x80\x02}q\x00X\x01\x00\x00\x00w".to_vec();
        pkl.extend_from_slice(b"ctorch._utils\n_rebuild_tensor_v2\n(");
        pkl.extend_from_slice(b"(X\x07\x00\x00\x00storagectorch\nHalfStorage\nX\x01\x00\x00\x000X\x03\x00\x00\x00cpuK\x06tQ");
        pkl.extend_from_slice(b"K\x00K\x02K\x03\x86K\x03K\x01\x86\x89]tRs.");

        let state_dict = load_state_dict(&pkl).unwrap();
        let spec = &state_dict["w"];
        assert_eq!(spec.dtype, DataType::F16);
        assert_eq!(spec.shape.as_ref(), &[2, 3]);
        assert_eq!(spec.stride.as_ref(), &[3, 1]);
        assert_eq!(spec.storage_key, "0");
    }

    #[test]
    fn non_tensor_values_are_skipped() {
        let mut pkl = b"\x80\x02}q\x00X\x04\x00\x00\x00stepK\x03s.".to_vec();
        assert!(load_state_dict(&pkl).unwrap().is_empty());
        pkl.pop();
        assert!(matches!(load_state_dict(&pkl), Err(PickleError::UnexpectedEof(_))));
    }

    #[test]
    fn long1_is_sign_extended() {
        let mut cursor = Cursor {
            bytes: b"\xff\x7f\x00\x80",
            pos: 0,
        };
        assert_eq!(cursor.long(1).unwrap(), -1);
        assert_eq!(cursor.long(1).unwrap(), 127);
        assert_eq!(cursor.long(2).unwrap(), -32768);
        assert_eq!(cursor.long(0).unwrap(), 0);
        assert!(matches!(cursor.long(9), Err(PickleError::LongTooWide(9))));
    }

    #[test]
    fn unknown_opcode_is_reported() {
        assert!(matches!(
            load_state_dict(b"\x80\x02\xfe"),
            Err(PickleError::UnsupportedOpcode {
                opcode: 0xfe,
                offset: 2,
            })
        ));
    }

    #[test]
    fn storage_types() {
        assert_eq!(storage_data_type("torch", "HalfStorage"), Some(DataType::F16));
        assert_eq!(storage_data_type("torch", "BoolStorage"), Some(DataType::Bool));
        assert_eq!(storage_data_type("torch", "QInt8Storage"), None);
        assert_eq!(storage_data_type("numpy", "FloatStorage"), None);
    }
}
