//! Checkpoint binary format (opaque stream contract, `spec.md` §6):
//! magic `CLLM`, a little-endian version/shape header, every tensor in
//! a fixed order, and a trailing Adam step + moment buffers. Exact
//! reload is required: forward on identical inputs after a round-trip
//! must reproduce the original logits bit-for-bit.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::ModelConfig;
use crate::error::{EngineError, Result};
use crate::params::{ParamLayout, ParamStore};

const MAGIC: &[u8; 4] = b"CLLM";
const FORMAT_VERSION: u32 = 1;

fn io_err(e: std::io::Error) -> EngineError {
    EngineError::CheckpointIo(e.to_string())
}

/// Writes a full checkpoint: header, every parameter tensor in
/// declaration order, then the Adam step and moment buffers
/// (`spec.md` §6).
pub fn write_checkpoint<W: Write>(w: &mut W, store: &ParamStore) -> Result<()> {
    w.write_all(MAGIC).map_err(io_err)?;
    w.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(io_err)?;

    let cfg = &store.layout.cfg;
    w.write_u32::<LittleEndian>(cfg.vocab_size as u32).map_err(io_err)?;
    w.write_u64::<LittleEndian>(cfg.embedding_dim as u64).map_err(io_err)?;
    w.write_u32::<LittleEndian>(cfg.num_layers as u32).map_err(io_err)?;
    w.write_u32::<LittleEndian>(cfg.num_heads as u32).map_err(io_err)?;
    w.write_u32::<LittleEndian>(cfg.ff_dim as u32).map_err(io_err)?;
    w.write_u32::<LittleEndian>(cfg.context_len as u32).map_err(io_err)?;

    write_f32_slice(w, &store.params[store.layout.wte_offset..store.layout.wte_offset + store.layout.wte_len])?;
    let d = cfg.embedding_dim;
    let f = cfg.ff_dim;
    for lo in &store.layout.layers {
        write_f32_slice(w, &store.params[lo.ln1_gamma..lo.ln1_gamma + d])?;
        write_f32_slice(w, &store.params[lo.ln1_beta..lo.ln1_beta + d])?;
        write_f32_slice(w, &store.params[lo.wq..lo.wq + d * d])?;
        write_f32_slice(w, &store.params[lo.wk..lo.wk + d * d])?;
        write_f32_slice(w, &store.params[lo.wv..lo.wv + d * d])?;
        write_f32_slice(w, &store.params[lo.ln2_gamma..lo.ln2_gamma + d])?;
        write_f32_slice(w, &store.params[lo.ln2_beta..lo.ln2_beta + d])?;
        write_f32_slice(w, &store.params[lo.w1..lo.w1 + f * d])?;
        write_f32_slice(w, &store.params[lo.b1..lo.b1 + f])?;
        write_f32_slice(w, &store.params[lo.w2..lo.w2 + d * f])?;
        write_f32_slice(w, &store.params[lo.b2..lo.b2 + d])?;
    }

    w.write_u64::<LittleEndian>(store.adam_step).map_err(io_err)?;
    write_f32_slice(w, &store.adam_m)?;
    write_f32_slice(w, &store.adam_v)?;

    Ok(())
}

/// Reads a checkpoint produced by `write_checkpoint`, reconstructing a
/// `ParamStore` whose shape matches the header exactly. The caller's
/// `expected` config, if given, is checked against the header so a
/// shape mismatch is a `Configuration` error rather than a silent
/// misread.
pub fn read_checkpoint<R: Read>(r: &mut R, expected: Option<&ModelConfig>) -> Result<ParamStore> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(io_err)?;
    if &magic != MAGIC {
        return Err(EngineError::CheckpointIo("bad magic".into()));
    }
    let version = r.read_u32::<LittleEndian>().map_err(io_err)?;
    if version != FORMAT_VERSION {
        return Err(EngineError::CheckpointIo(format!("unsupported checkpoint version {version}")));
    }

    let vocab_size = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let embedding_dim = r.read_u64::<LittleEndian>().map_err(io_err)? as usize;
    let num_layers = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let num_heads = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let ff_dim = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;
    let context_len = r.read_u32::<LittleEndian>().map_err(io_err)? as usize;

    let cfg = ModelConfig {
        vocab_size,
        embedding_dim,
        num_layers,
        num_heads,
        ff_dim,
        context_len,
    };
    cfg.validate()?;
    if let Some(expected) = expected {
        if expected.vocab_size != cfg.vocab_size
            || expected.embedding_dim != cfg.embedding_dim
            || expected.num_layers != cfg.num_layers
            || expected.num_heads != cfg.num_heads
            || expected.ff_dim != cfg.ff_dim
            || expected.context_len != cfg.context_len
        {
            return Err(EngineError::Configuration(
                "checkpoint shape does not match the expected model configuration".into(),
            ));
        }
    }

    let layout = ParamLayout::new(cfg.clone());
    let mut params = vec![0.0f32; layout.padded_len];

    read_f32_slice(r, &mut params[layout.wte_offset..layout.wte_offset + layout.wte_len])?;
    let d = cfg.embedding_dim;
    let f = cfg.ff_dim;
    for lo in &layout.layers {
        read_f32_slice(r, &mut params[lo.ln1_gamma..lo.ln1_gamma + d])?;
        read_f32_slice(r, &mut params[lo.ln1_beta..lo.ln1_beta + d])?;
        read_f32_slice(r, &mut params[lo.wq..lo.wq + d * d])?;
        read_f32_slice(r, &mut params[lo.wk..lo.wk + d * d])?;
        read_f32_slice(r, &mut params[lo.wv..lo.wv + d * d])?;
        read_f32_slice(r, &mut params[lo.ln2_gamma..lo.ln2_gamma + d])?;
        read_f32_slice(r, &mut params[lo.ln2_beta..lo.ln2_beta + d])?;
        read_f32_slice(r, &mut params[lo.w1..lo.w1 + f * d])?;
        read_f32_slice(r, &mut params[lo.b1..lo.b1 + f])?;
        read_f32_slice(r, &mut params[lo.w2..lo.w2 + d * f])?;
        read_f32_slice(r, &mut params[lo.b2..lo.b2 + d])?;
    }

    let adam_step = r.read_u64::<LittleEndian>().map_err(io_err)?;
    let mut adam_m = vec![0.0f32; layout.wte_len];
    let mut adam_v = vec![0.0f32; layout.wte_len];
    read_f32_slice(r, &mut adam_m)?;
    read_f32_slice(r, &mut adam_v)?;

    let grads = vec![0.0f32; layout.padded_len];

    Ok(ParamStore::from_parts(layout, params, grads, adam_m, adam_v, adam_step))
}

fn write_f32_slice<W: Write>(w: &mut W, data: &[f32]) -> Result<()> {
    for &x in data {
        w.write_f32::<LittleEndian>(x).map_err(io_err)?;
    }
    Ok(())
}

fn read_f32_slice<R: Read>(r: &mut R, out: &mut [f32]) -> Result<()> {
    for slot in out.iter_mut() {
        *slot = r.read_f32::<LittleEndian>().map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            embedding_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ff_dim: 16,
            context_len: 4,
        }
    }

    #[test]
    fn round_trip_reproduces_params_bit_for_bit() {
        let mut store = ParamStore::new(cfg(), 42).unwrap();
        store.adam_step = 7;
        store.adam_m.iter_mut().enumerate().for_each(|(i, m)| *m = i as f32 * 0.5);
        store.adam_v.iter_mut().enumerate().for_each(|(i, v)| *v = i as f32 * 0.25);

        let mut buf = Vec::new();
        write_checkpoint(&mut buf, &store).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let restored = read_checkpoint(&mut cursor, Some(&cfg())).unwrap();

        assert_eq!(restored.params, store.params);
        assert_eq!(restored.adam_step, store.adam_step);
        assert_eq!(restored.adam_m, store.adam_m);
        assert_eq!(restored.adam_v, store.adam_v);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let store = ParamStore::new(cfg(), 1).unwrap();
        let mut buf = Vec::new();
        write_checkpoint(&mut buf, &store).unwrap();

        let mut wrong = cfg();
        wrong.embedding_dim = 16;
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_checkpoint(&mut cursor, Some(&wrong)).is_err());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = vec![0u8; 32];
        let mut cursor = std::io::Cursor::new(&mut buf);
        assert!(read_checkpoint(&mut cursor, None).is_err());
    }
}
