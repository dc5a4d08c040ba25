//! PyTorch checkpoints (`torch.save` of a state dict) into [`StateDict`].
//!
//! Two containers exist. The zip archive written since torch 1.6 holds
//! `<prefix>/data.pkl` and one raw entry `<prefix>/data/<key>` per storage.
//! The older stream is a run of pickles (magic number, protocol version,
//! system info, the object, the storage keys) followed by every storage in
//! key order, each prefixed with its element count. Both describe a tensor
//! as a `_rebuild_tensor_v2` call over a persistent storage reference.
//!
//! Only the pickle opcodes and callables that state dicts use are
//! understood; any other call is kept as an opaque value and skipped.

use std::collections::HashMap;
use std::io::{self, Cursor, Read};

use layers::StateDict;
use ndarray::{ArrayD, IxDyn};
use thiserror::Error;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::ArtifactError;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const PROTO: u8 = 0x80;
const LONG1: u8 = 0x8a;

/// Whether `bytes` start like a `torch.save` output. The legacy stream
/// always opens with the magic number pickled as a `LONG1`.
pub(crate) fn is_torch_checkpoint(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
        || (bytes.len() > 3 && bytes[0] == PROTO && bytes[1] <= 5 && bytes[2] == LONG1)
}

#[derive(Debug, Error)]
enum CheckpointError {
    #[error("unexpected end of data")]
    Truncated,
    #[error("unsupported pickle opcode 0x{0:02x}")]
    Opcode(u8),
    #[error("unsupported pickle protocol {0}")]
    Protocol(u8),
    #[error("pickle stack underflow")]
    Underflow,
    #[error("pickle memo entry {0} is missing")]
    Memo(u32),
    #[error("{0}")]
    Malformed(String),
    #[error("archive: {0}")]
    Archive(#[from] ZipError),
    #[error("archive entry: {0}")]
    Io(#[from] io::Error),
}

fn malformed(reason: impl Into<String>) -> CheckpointError {
    CheckpointError::Malformed(reason.into())
}

/// Element type of a torch storage, from its class name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elem {
    F16,
    BF16,
    F32,
    F64,
    U8,
    I8,
    I16,
    I32,
    I64,
    Bool,
}

impl Elem {
    fn from_storage(class: &str) -> Option<Self> {
        Some(match class {
            "HalfStorage" => Self::F16,
            "BFloat16Storage" => Self::BF16,
            "FloatStorage" => Self::F32,
            "DoubleStorage" => Self::F64,
            "ByteStorage" => Self::U8,
            "CharStorage" => Self::I8,
            "ShortStorage" => Self::I16,
            "IntStorage" => Self::I32,
            "LongStorage" => Self::I64,
            "BoolStorage" => Self::Bool,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 | Self::Bool => 1,
            Self::F16 | Self::BF16 | Self::I16 => 2,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// `b` holds exactly one element of a float storage.
    fn decode(self, b: &[u8]) -> f32 {
        match self {
            Self::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32,
            _ => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct StorageRef {
    key: String,
    elem: Elem,
    /// Element offset of a legacy storage view into its root storage.
    base: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct TensorRef {
    storage: StorageRef,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Mark,
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Global(String, String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Storage(StorageRef),
    Tensor(TensorRef),
    /// Result of a call this reader does not model.
    Opaque(String),
}

fn as_usize(value: &Value) -> Result<usize, CheckpointError> {
    match value {
        Value::Int(v) => usize::try_from(*v).map_err(|_| malformed(format!("negative size {v}"))),
        other => Err(malformed(format!("expected an integer, got {other:?}"))),
    }
}

fn as_usizes(value: &Value) -> Result<Vec<usize>, CheckpointError> {
    match value {
        Value::Tuple(items) | Value::List(items) => items.iter().map(as_usize).collect(),
        other => Err(malformed(format!("expected a size tuple, got {other:?}"))),
    }
}

fn pairs(items: Vec<Value>) -> Result<Vec<(Value, Value)>, CheckpointError> {
    if items.len() % 2 != 0 {
        return Err(malformed("odd number of dictionary items"));
    }
    let mut items = items.into_iter();
    let mut out = Vec::new();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        out.push((key, value));
    }
    Ok(out)
}

/// `('storage', class, key, location, numel[, view])`. Legacy views carry
/// `(view_key, offset, size)` and resolve to a slice of the root storage.
fn storage_ref(pid: Value) -> Result<StorageRef, CheckpointError> {
    let Value::Tuple(fields) = pid else {
        return Err(malformed("persistent id is not a tuple"));
    };
    match fields.as_slice() {
        [Value::Str(tag), class, Value::Str(key), _, _, rest @ ..] if tag == "storage" => {
            let class = match class {
                Value::Global(_, name) | Value::Str(name) => name.as_str(),
                _ => "",
            };
            let elem = Elem::from_storage(class)
                .ok_or_else(|| malformed(format!("unknown storage type '{class}'")))?;
            let base = match rest.first() {
                Some(Value::Tuple(view)) => match view.as_slice() {
                    [_, offset, ..] => as_usize(offset)?,
                    _ => 0,
                },
                _ => 0,
            };
            Ok(StorageRef {
                key: key.clone(),
                elem,
                base,
            })
        }
        _ => Err(malformed("unrecognized persistent id")),
    }
}

fn rebuild_tensor(args: Vec<Value>) -> Result<Value, CheckpointError> {
    let mut args = args.into_iter();
    let (Some(Value::Storage(storage)), Some(offset), Some(shape), Some(stride)) =
        (args.next(), args.next(), args.next(), args.next())
    else {
        return Err(malformed(
            "tensor rebuild expects storage, offset, size and stride",
        ));
    };
    let shape = as_usizes(&shape)?;
    let stride = as_usizes(&stride)?;
    if shape.len() != stride.len() {
        return Err(malformed("tensor size and stride differ in rank"));
    }
    Ok(Value::Tensor(TensorRef {
        storage,
        offset: as_usize(&offset)?,
        shape,
        stride,
    }))
}

fn call(callable: Value, args: Value) -> Result<Value, CheckpointError> {
    let Value::Global(module, name) = callable else {
        return Ok(Value::Opaque("call of a computed callable".into()));
    };
    let args = match args {
        Value::Tuple(items) => items,
        other => vec![other],
    };
    match (module.as_str(), name.as_str()) {
        ("collections", "OrderedDict") => match args.into_iter().next() {
            Some(Value::List(items)) => {
                let entries = items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::Tuple(mut kv) if kv.len() == 2 => {
                            let value = kv.pop()?;
                            let key = kv.pop()?;
                            Some((key, value))
                        }
                        _ => None,
                    })
                    .collect();
                Ok(Value::Dict(entries))
            }
            _ => Ok(Value::Dict(Vec::new())),
        },
        ("torch._utils", "_rebuild_tensor_v2" | "_rebuild_tensor") => rebuild_tensor(args),
        ("torch._utils", "_rebuild_parameter" | "_rebuild_parameter_with_state") => args
            .into_iter()
            .next()
            .ok_or_else(|| malformed("parameter rebuild without data")),
        // (func, type, args, state)
        ("torch._tensor", "_rebuild_from_type_v2") => {
            let mut args = args.into_iter();
            match (args.next(), args.next(), args.next()) {
                (Some(func), Some(_), Some(inner)) => call(func, inner),
                _ => Err(malformed("typed rebuild expects func, type and args")),
            }
        }
        _ => Ok(Value::Opaque(format!("{module}.{name}"))),
    }
}

/// One pickle program over a shared buffer; several may run back to back.
struct Unpickler<'a> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    memo: HashMap<u32, Value>,
    /// Every storage referenced so far, by key.
    storages: HashMap<String, Elem>,
}

impl<'a> Unpickler<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            stack: Vec::new(),
            memo: HashMap::new(),
            storages: HashMap::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CheckpointError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.input.len())
            .ok_or(CheckpointError::Truncated)?;
        let input = self.input;
        let bytes = &input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, CheckpointError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CheckpointError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CheckpointError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, CheckpointError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CheckpointError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn line(&mut self) -> Result<&'a str, CheckpointError> {
        let input = self.input;
        let rest = &input[self.pos..];
        let len = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(CheckpointError::Truncated)?;
        self.pos += len + 1;
        std::str::from_utf8(&rest[..len]).map_err(|_| malformed("text line is not utf-8"))
    }

    fn string(&mut self, len: usize) -> Result<Value, CheckpointError> {
        let bytes = self.take(len)?;
        Ok(Value::Str(String::from_utf8_lossy(bytes).into_owned()))
    }

    fn pop(&mut self) -> Result<Value, CheckpointError> {
        self.stack.pop().ok_or(CheckpointError::Underflow)
    }

    fn top_mut(&mut self) -> Result<&mut Value, CheckpointError> {
        self.stack.last_mut().ok_or(CheckpointError::Underflow)
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, CheckpointError> {
        let mark = self
            .stack
            .iter()
            .rposition(|v| matches!(v, Value::Mark))
            .ok_or_else(|| malformed("missing mark"))?;
        let items = self.stack.split_off(mark + 1);
        self.stack.pop();
        Ok(items)
    }

    fn memoize(&mut self, index: u32) -> Result<(), CheckpointError> {
        let top = self.stack.last().ok_or(CheckpointError::Underflow)?.clone();
        self.memo.insert(index, top);
        Ok(())
    }

    fn recall(&mut self, index: u32) -> Result<(), CheckpointError> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or(CheckpointError::Memo(index))?;
        self.stack.push(value);
        Ok(())
    }

    /// Runs up to and including the next STOP. The stack and memo are reset
    /// so the following pickle in the buffer can be read with the same
    /// reader.
    fn load(&mut self) -> Result<Value, CheckpointError> {
        self.stack.clear();
        self.memo.clear();
        loop {
            let op = self.u8()?;
            match op {
                PROTO => {
                    let version = self.u8()?;
                    if version > 5 {
                        return Err(CheckpointError::Protocol(version));
                    }
                }
                // FRAME
                0x95 => {
                    self.take(8)?;
                }
                b'.' => return self.pop(),
                b'(' => self.stack.push(Value::Mark),
                b')' => self.stack.push(Value::Tuple(Vec::new())),
                b']' => self.stack.push(Value::List(Vec::new())),
                b'}' => self.stack.push(Value::Dict(Vec::new())),
                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                b'K' => {
                    let v = self.u8()?;
                    self.stack.push(Value::Int(v.into()));
                }
                b'M' => {
                    let v = self.u16()?;
                    self.stack.push(Value::Int(v.into()));
                }
                b'J' => {
                    let v = self.i32()?;
                    self.stack.push(Value::Int(v.into()));
                }
                b'I' => {
                    let value = match self.line()? {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        text => Value::Int(
                            text.parse()
                                .map_err(|_| malformed(format!("bad INT literal '{text}'")))?,
                        ),
                    };
                    self.stack.push(value);
                }
                LONG1 => {
                    let n = self.u8()? as usize;
                    let bytes = self.take(n)?;
                    self.stack.push(Value::Int(long_le(bytes)));
                }
                b'G' => {
                    let b = self.take(8)?;
                    let v = f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                    self.stack.push(Value::Float(v));
                }
                b'X' => {
                    let n = self.u32()? as usize;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                b'T' => {
                    let n = usize::try_from(self.i32()?)
                        .map_err(|_| malformed("negative string length"))?;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                b'U' | 0x8c => {
                    let n = self.u8()? as usize;
                    let v = self.string(n)?;
                    self.stack.push(v);
                }
                b'C' => {
                    let n = self.u8()? as usize;
                    let bytes = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                b'B' => {
                    let n = self.u32()? as usize;
                    let bytes = self.take(n)?.to_vec();
                    self.stack.push(Value::Bytes(bytes));
                }
                b'c' => {
                    let module = self.line()?.to_string();
                    let name = self.line()?.to_string();
                    self.stack.push(Value::Global(module, name));
                }
                // STACK_GLOBAL
                0x93 => match (self.pop()?, self.pop()?) {
                    (Value::Str(name), Value::Str(module)) => {
                        self.stack.push(Value::Global(module, name))
                    }
                    _ => return Err(malformed("STACK_GLOBAL expects two strings")),
                },
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                0x85..=0x87 => {
                    let n = (op - 0x84) as usize;
                    let at = self
                        .stack
                        .len()
                        .checked_sub(n)
                        .ok_or(CheckpointError::Underflow)?;
                    let items = self.stack.split_off(at);
                    self.stack.push(Value::Tuple(items));
                }
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                b'a' => {
                    let value = self.pop()?;
                    match self.top_mut()? {
                        Value::List(list) => list.push(value),
                        _ => return Err(malformed("APPEND to a non-list")),
                    }
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    match self.top_mut()? {
                        Value::List(list) => list.extend(items),
                        _ => return Err(malformed("APPENDS to a non-list")),
                    }
                }
                b'd' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Dict(pairs(items)?));
                }
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    match self.top_mut()? {
                        Value::Dict(dict) => dict.push((key, value)),
                        _ => return Err(malformed("SETITEM on a non-dict")),
                    }
                }
                b'u' => {
                    let items = pairs(self.pop_mark()?)?;
                    match self.top_mut()? {
                        Value::Dict(dict) => dict.extend(items),
                        _ => return Err(malformed("SETITEMS on a non-dict")),
                    }
                }
                b'q' => {
                    let index = self.u8()?.into();
                    self.memoize(index)?;
                }
                b'r' => {
                    let index = self.u32()?;
                    self.memoize(index)?;
                }
                // MEMOIZE
                0x94 => {
                    let index = self.memo.len() as u32;
                    self.memoize(index)?;
                }
                b'h' => {
                    let index = self.u8()?.into();
                    self.recall(index)?;
                }
                b'j' => {
                    let index = self.u32()?;
                    self.recall(index)?;
                }
                b'Q' => {
                    let storage = storage_ref(self.pop()?)?;
                    self.storages.insert(storage.key.clone(), storage.elem);
                    self.stack.push(Value::Storage(storage));
                }
                // REDUCE, NEWOBJ
                b'R' | 0x81 => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = call(callable, args)?;
                    self.stack.push(value);
                }
                // BUILD: the state of dicts and opaque objects is not needed
                b'b' => {
                    self.pop()?;
                }
                other => return Err(CheckpointError::Opcode(other)),
            }
        }
    }
}

/// Little-endian two's complement, truncated to 64 bits.
fn long_le(bytes: &[u8]) -> i64 {
    let mut value: i64 = 0;
    for (i, b) in bytes.iter().take(8).enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    if bytes.len() < 8 && bytes.last().is_some_and(|b| b & 0x80 != 0) {
        value |= -1i64 << (8 * bytes.len());
    }
    value
}

/// Named tensors of the checkpoint. Training checkpoints nest the
/// parameters under `state_dict`; other entries are skipped.
fn tensor_entries(root: Value) -> Result<Vec<(String, TensorRef)>, CheckpointError> {
    let Value::Dict(mut entries) = root else {
        return Err(malformed("checkpoint is not a dictionary"));
    };
    let nested = entries.iter().position(|(key, value)| {
        matches!(key, Value::Str(k) if k == "state_dict") && matches!(value, Value::Dict(_))
    });
    if let Some(at) = nested {
        if let (_, Value::Dict(inner)) = entries.swap_remove(at) {
            entries = inner;
        }
    }

    let mut tensors = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        match (key, value) {
            (Value::Str(name), Value::Tensor(tensor)) => tensors.push((name, tensor)),
            (key, _) => debug!(entry = ?key, "skipping non-tensor checkpoint entry"),
        }
    }
    Ok(tensors)
}

type Parsed = (Vec<(String, TensorRef)>, HashMap<String, Vec<u8>>);

fn parse_archive(bytes: &[u8]) -> Result<Parsed, CheckpointError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let pickle_name = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
        .ok_or_else(|| malformed("archive has no data.pkl"))?;
    let prefix = &pickle_name[..pickle_name.len() - "data.pkl".len()];

    let pickle = read_entry(&mut archive, &pickle_name)?;
    let tensors = tensor_entries(Unpickler::new(&pickle).load()?)?;

    let mut storages = HashMap::new();
    for (_, tensor) in &tensors {
        let key = &tensor.storage.key;
        if !storages.contains_key(key) {
            let data = read_entry(&mut archive, &format!("{prefix}data/{key}"))?;
            storages.insert(key.clone(), data);
        }
    }
    Ok((tensors, storages))
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, CheckpointError> {
    let mut entry = archive.by_name(name)?;
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    Ok(data)
}

fn parse_legacy(bytes: &[u8]) -> Result<Parsed, CheckpointError> {
    let mut reader = Unpickler::new(bytes);
    // magic number, protocol version, system info
    for _ in 0..3 {
        reader.load()?;
    }
    let tensors = tensor_entries(reader.load()?)?;
    let Value::List(keys) = reader.load()? else {
        return Err(malformed("storage key list is not a list"));
    };

    let mut storages = HashMap::new();
    for key in keys {
        let Value::Str(key) = key else {
            return Err(malformed("storage key is not a string"));
        };
        let Some(elem) = reader.storages.get(&key).copied() else {
            // Without its element type the remaining storages cannot be
            // located; tensors that need them fail below.
            debug!(storage = %key, "storage of unknown type, stopping");
            break;
        };
        let numel = reader.u64()? as usize;
        let len = numel
            .checked_mul(elem.size())
            .ok_or(CheckpointError::Truncated)?;
        let data = reader.take(len)?.to_vec();
        storages.insert(key, data);
    }
    Ok((tensors, storages))
}

/// Reads `tensor` in row-major order, honoring its offset and strides.
/// `None` when it reaches past the end of `bytes`.
fn gather(tensor: &TensorRef, bytes: &[u8]) -> Option<Vec<f32>> {
    let elem = tensor.storage.elem;
    let size = elem.size();
    let numel: usize = tensor.shape.iter().product();
    let start = tensor.storage.base + tensor.offset;
    let mut index = vec![0usize; tensor.shape.len()];
    let mut values = Vec::with_capacity(numel);
    for _ in 0..numel {
        let at = start
            + index
                .iter()
                .zip(&tensor.stride)
                .map(|(i, s)| i * s)
                .sum::<usize>();
        values.push(elem.decode(bytes.get(at * size..(at + 1) * size)?));
        for axis in (0..index.len()).rev() {
            index[axis] += 1;
            if index[axis] < tensor.shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    Some(values)
}

/// Decodes a `torch.save` checkpoint of a state dict. Float and double
/// tensors are kept (doubles narrowed), step counters are skipped and any
/// other element type is rejected.
pub(crate) fn read_checkpoint(bytes: &[u8], artifact: &str) -> Result<StateDict, ArtifactError> {
    let decode = |reason: String| ArtifactError::Decode {
        artifact: artifact.to_string(),
        reason,
    };
    let parsed = if bytes.starts_with(ZIP_MAGIC) {
        parse_archive(bytes)
    } else {
        parse_legacy(bytes)
    };
    let (tensors, storages) = parsed.map_err(|e| decode(e.to_string()))?;

    let mut dict = StateDict::new();
    for (name, tensor) in tensors {
        let elem = tensor.storage.elem;
        if !elem.is_float() {
            if name.ends_with("num_batches_tracked") {
                debug!(tensor = %name, "skipping step counter");
                continue;
            }
            return Err(ArtifactError::UnsupportedDtype {
                name,
                dtype: format!("{elem:?}"),
            });
        }
        let bytes = storages.get(&tensor.storage.key).ok_or_else(|| {
            decode(format!(
                "tensor '{name}': storage '{}' is missing",
                tensor.storage.key
            ))
        })?;
        let values = gather(&tensor, bytes)
            .ok_or_else(|| decode(format!("tensor '{name}' reaches past its storage")))?;
        let array = ArrayD::from_shape_vec(IxDyn(&tensor.shape), values)
            .map_err(|e| decode(format!("tensor '{name}': {e}")))?;
        dict.insert(name, array);
    }
    debug!(path = %artifact, tensors = dict.len(), "decoded torch checkpoint");
    Ok(dict)
}
