use crate::core::model::gpt2;
use crate::core::{
    Cancellable, DType, Error, Hyperparameters, LanguageModel, Result, Shape, Tensor, TokenDictionary, WeightRegistry,
};
use crate::infra::quantize::QuantizeConfig;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

pub const GGML_MAGIC: u32 = 0x6767_6d6c;

const MAX_DIMS: i32 = 4;

pub type ProgressFn = Arc<dyn Fn(i64, i64) + Send + Sync>;

/// Counts bytes pulled through the inner reader and reports `(consumed, total)`.
pub struct ProgressReader<R> {
    inner: R,
    consumed: u64,
    total: u64,
    on_progress: Option<ProgressFn>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, total: u64, on_progress: Option<ProgressFn>) -> Self {
        Self {
            inner,
            consumed: 0,
            total,
            on_progress,
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        if let Some(cb) = &self.on_progress {
            cb(self.consumed as i64, self.total as i64);
        }
        Ok(n)
    }
}

fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let value = reader.read_i32::<LittleEndian>()?;
    usize::try_from(value).map_err(|_| Error::format(format!("Negative {} {}", what, value)))
}

fn read_bytes<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(format!("cannot allocate {} bytes", len)))?;
    buf.resize(len, 0);
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

// `None` on a clean end of file, i.e. no bytes at all before the next header.
fn read_header_start<R: Read>(reader: &mut R) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::format("Truncated tensor header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

pub fn read_hparams<R: Read>(reader: &mut R) -> Result<Hyperparameters> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != GGML_MAGIC {
        return Err(Error::format(format!("Invalid magic {:#010x}", magic)));
    }

    let n_vocab = read_len(reader, "n_vocab")?;
    let n_ctx = read_len(reader, "n_ctx")?;
    let n_embd = read_len(reader, "n_embd")?;
    let n_head = read_len(reader, "n_head")?;
    let n_layer = read_len(reader, "n_layer")?;
    let ftype = reader.read_i32::<LittleEndian>()?;

    let hp = Hyperparameters::new(n_vocab, n_ctx, n_embd, n_head, n_layer).ftype(ftype);
    hp.validate()?;
    Ok(hp)
}

pub fn read_dictionary<R: Read>(reader: &mut R, hp: &Hyperparameters) -> Result<TokenDictionary> {
    let n_vocab = read_len(reader, "dictionary size")?;
    if n_vocab != hp.n_vocab {
        return Err(Error::format(format!(
            "Model dictionary n_vocab {} does not match hyperparameters n_vocab {}",
            n_vocab, hp.n_vocab
        )));
    }

    let mut tokens = Vec::with_capacity(n_vocab);
    for _ in 0..n_vocab {
        let len = reader.read_u32::<LittleEndian>()? as usize;
        tokens.push(read_bytes(reader, len)?);
    }
    Ok(TokenDictionary::new(tokens))
}

/// Reads a complete model file, converting tensors selected by `quantize` as they arrive.
pub fn read_model<R: Read>(
    reader: &mut R,
    quantize: &QuantizeConfig,
    cancel: Option<&Cancellable>,
) -> Result<LanguageModel> {
    let mut hp = read_hparams(reader)?;
    let dictionary = read_dictionary(reader, &hp)?;
    let desc = gpt2::model_desc(&hp)?;
    debug!("hparams {:?}, {} tokens", hp, dictionary.len());

    let mut weights = WeightRegistry::new();
    while let Some(n_dims) = read_header_start(reader)? {
        if let Some(c) = cancel {
            c.check()?;
        }

        let name_len = read_len(reader, "tensor name length")?;
        let ttype = reader.read_i32::<LittleEndian>()?;
        if !(1..=MAX_DIMS).contains(&n_dims) {
            return Err(Error::format(format!("Invalid tensor rank {}", n_dims)));
        }

        let mut dims = Vec::with_capacity(n_dims as usize);
        for _ in 0..n_dims {
            dims.push(read_len(reader, "tensor dimension")?);
        }
        // ggml lists the fastest-varying dimension first
        dims.reverse();

        let name = String::from_utf8(read_bytes(reader, name_len)?)
            .map_err(|_| Error::format("Tensor name is not valid UTF-8"))?;
        let expected = desc
            .get(&name)
            .map_err(|_| Error::format(format!("Tensor {} not found in model definition", name)))?;

        let shape = Shape::new(dims);
        if shape.numel() != expected.shape.numel() {
            return Err(Error::format(format!(
                "Tensor {} has {} elements, expected {}",
                name,
                shape.numel(),
                expected.shape.numel()
            )));
        }
        if shape != expected.shape {
            return Err(Error::format(format!(
                "Tensor {} has shape {}, expected {}",
                name, shape, expected.shape
            )));
        }

        let dtype = DType::from_ggml_id(ttype)?;
        let data = read_bytes(reader, shape.byte_size(dtype)?)?;
        let tensor = quantize.apply(&name, Tensor::from_bytes(dtype, shape, data)?)?;
        debug!("{} {} {}", name, tensor.shape(), tensor.dtype().name());
        weights.insert(&name, tensor)?;
    }

    if let Some(target) = quantize.target() {
        hp.ftype = Hyperparameters::ftype_for(target);
    }

    LanguageModel::new(hp, dictionary, weights)
}

pub fn read_model_file(
    path: &Path,
    quantize: &QuantizeConfig,
    cancel: Option<&Cancellable>,
    on_progress: Option<ProgressFn>,
) -> Result<LanguageModel> {
    let file = File::open(path)?;
    let total = file.metadata()?.len();
    if let Some(cb) = &on_progress {
        cb(-1, total as i64);
    }

    info!("loading model from {}", path.display());
    let mut reader = BufReader::new(ProgressReader::new(file, total, on_progress));
    let model = read_model(&mut reader, quantize, cancel)?;
    info!(
        "loaded {} tensors ({} bytes) from {}",
        model.weights().len(),
        reader.get_ref().consumed(),
        path.display()
    );
    Ok(model)
}

/// Serializes `model`. A `model/lm_head` identical to `model/wte` is left out,
/// readers tie it back on load.
pub fn write_model<W: Write>(writer: &mut W, model: &LanguageModel) -> Result<()> {
    let hp = model.hparams();
    writer.write_u32::<LittleEndian>(GGML_MAGIC)?;
    for value in [hp.n_vocab, hp.n_ctx, hp.n_embd, hp.n_head, hp.n_layer] {
        writer.write_i32::<LittleEndian>(to_i32(value)?)?;
    }
    writer.write_i32::<LittleEndian>(hp.ftype)?;

    let dictionary = model.dictionary();
    writer.write_i32::<LittleEndian>(to_i32(dictionary.len())?)?;
    for token in dictionary.iter() {
        writer.write_u32::<LittleEndian>(token.len() as u32)?;
        writer.write_all(token)?;
    }

    let wte = model.weight(gpt2::WTE)?;
    for (name, tensor) in model.weights().flatten() {
        let data = tensor.to_bytes();
        if name == gpt2::LM_HEAD && tensor.dtype() == wte.dtype() && data == wte.to_bytes() {
            continue;
        }

        writer.write_i32::<LittleEndian>(tensor.n_dims() as i32)?;
        writer.write_i32::<LittleEndian>(to_i32(name.len())?)?;
        writer.write_i32::<LittleEndian>(tensor.dtype().ggml_id())?;
        for &dim in tensor.shape().dims().iter().rev() {
            writer.write_i32::<LittleEndian>(to_i32(dim)?)?;
        }
        writer.write_all(name.as_bytes())?;
        writer.write_all(&data)?;
    }

    writer.flush()?;
    Ok(())
}

pub fn write_model_file(path: &Path, model: &LanguageModel) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    write_model(&mut writer, model)?;
    info!("wrote model to {}", path.display());
    Ok(())
}

fn to_i32(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| Error::format(format!("{} does not fit the file format", value)))
}
