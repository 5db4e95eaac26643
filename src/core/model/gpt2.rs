use crate::core::tensor::ops::{dot, softmax_in_place};
use crate::core::{
    Cancellable, DType, Error, Hyperparameters, KvCache, ModelDesc, Result, Shape, Tensor, TensorDesc, TensorOps,
    TokenId,
};
use rayon::prelude::*;

use super::LanguageModel;

const LAYER_NORM_EPS: f32 = 1e-5;

pub const WTE: &str = "model/wte";
pub const WPE: &str = "model/wpe";
pub const LM_HEAD: &str = "model/lm_head";

pub fn layer_path(layer: usize, name: &str) -> String {
    format!("model/h{}/{}", layer, name)
}

/// Expected tensors of a GPT-2 checkpoint. Shapes are row-major with the
/// contiguous dimension last, so `[out, in]` for projection matrices.
pub fn model_desc(hp: &Hyperparameters) -> Result<ModelDesc> {
    let d = hp.d_model();
    let w = hp.weight_dtype()?;
    let f32 = DType::F32;

    let mut desc = ModelDesc::new();
    desc.insert("model/ln_f/g", TensorDesc::new(&[d], f32))?;
    desc.insert("model/ln_f/b", TensorDesc::new(&[d], f32))?;
    desc.insert(WTE, TensorDesc::new(&[hp.n_vocab, d], w))?;
    desc.insert(WPE, TensorDesc::new(&[hp.n_ctx, d], f32))?;
    desc.insert(LM_HEAD, TensorDesc::new(&[hp.n_vocab, d], w))?;

    for i in 0..hp.n_layer {
        let p = |name: &str| layer_path(i, name);
        desc.insert(&p("ln_1/g"), TensorDesc::new(&[d], f32))?;
        desc.insert(&p("ln_1/b"), TensorDesc::new(&[d], f32))?;
        desc.insert(&p("ln_2/g"), TensorDesc::new(&[d], f32))?;
        desc.insert(&p("ln_2/b"), TensorDesc::new(&[d], f32))?;
        desc.insert(&p("attn/c_attn/w"), TensorDesc::new(&[3 * d, d], w))?;
        desc.insert(&p("attn/c_attn/b"), TensorDesc::new(&[3 * d], f32))?;
        desc.insert(&p("attn/c_proj/w"), TensorDesc::new(&[d, d], w))?;
        desc.insert(&p("attn/c_proj/b"), TensorDesc::new(&[d], f32))?;
        desc.insert(&p("mlp/c_fc/w"), TensorDesc::new(&[hp.d_ff(), d], w))?;
        desc.insert(&p("mlp/c_fc/b"), TensorDesc::new(&[hp.d_ff()], f32))?;
        desc.insert(&p("mlp/c_proj/w"), TensorDesc::new(&[d, hp.d_ff()], w))?;
        desc.insert(&p("mlp/c_proj/b"), TensorDesc::new(&[d], f32))?;
    }

    Ok(desc)
}

/// Runs `tokens` through the network at positions `n_past..n_past + tokens.len()`,
/// appending their keys and values to `cache`. Returns logits `[n_tokens, n_vocab]`.
pub fn forward(
    model: &LanguageModel,
    cache: &mut KvCache,
    tokens: &[TokenId],
    n_past: usize,
    cancel: Option<&Cancellable>,
) -> Result<Tensor> {
    let hp = model.hparams();
    let d = hp.d_model();
    let n = tokens.len();

    if n == 0 {
        return Err(Error::shape("forward pass needs at least one token"));
    }
    if n_past + n > hp.n_ctx.min(cache.n_ctx()) {
        return Err(Error::OutOfBounds {
            offset: n_past,
            n_tokens: n,
            n_ctx: hp.n_ctx.min(cache.n_ctx()),
        });
    }

    let mut x = embed(model, tokens, n_past)?;
    let w = move |path: String| model.weight(&path);

    for layer in 0..hp.n_layer {
        if let Some(c) = cancel {
            c.check()?;
        }
        let p = |name: &str| layer_path(layer, name);

        let h = x.layer_norm(w(p("ln_1/g"))?, w(p("ln_1/b"))?, LAYER_NORM_EPS)?;
        let qkv = h.linear(w(p("attn/c_attn/w"))?, Some(w(p("attn/c_attn/b"))?))?;

        let (q, k, v) = split_qkv(&qkv, d)?;
        cache.write(layer, n_past, n, &k, &v)?;
        let attn = attention(&q, cache, layer, n_past, n, hp.n_head)?;

        let attn = attn.linear(w(p("attn/c_proj/w"))?, Some(w(p("attn/c_proj/b"))?))?;
        x = x.add(&attn)?;

        let h = x.layer_norm(w(p("ln_2/g"))?, w(p("ln_2/b"))?, LAYER_NORM_EPS)?;
        let ff = h
            .linear(w(p("mlp/c_fc/w"))?, Some(w(p("mlp/c_fc/b"))?))?
            .gelu()?
            .linear(w(p("mlp/c_proj/w"))?, Some(w(p("mlp/c_proj/b"))?))?;
        x = x.add(&ff)?;
    }

    if let Some(c) = cancel {
        c.check()?;
    }

    let x = x.layer_norm(w("model/ln_f/g".into())?, w("model/ln_f/b".into())?, LAYER_NORM_EPS)?;
    x.linear(w(LM_HEAD.into())?, None)
}

fn embed(model: &LanguageModel, tokens: &[TokenId], n_past: usize) -> Result<Tensor> {
    let hp = model.hparams();
    let d = hp.d_model();
    let wte = model.weight(WTE)?;
    let wpe = model.weight(WPE)?;

    let mut data = vec![0.0f32; tokens.len() * d];
    let mut pos = vec![0.0f32; d];
    for (i, (token, row)) in tokens.iter().zip(data.chunks_exact_mut(d)).enumerate() {
        if token.index() >= hp.n_vocab {
            return Err(Error::shape(format!("token id {} outside vocabulary of {}", token.0, hp.n_vocab)));
        }
        wte.row_into(token.index(), row)?;
        wpe.row_into(n_past + i, &mut pos)?;
        for (r, p) in row.iter_mut().zip(&pos) {
            *r += p;
        }
    }

    Ok(Tensor::new(data, Shape::new(vec![tokens.len(), d])))
}

fn split_qkv(qkv: &Tensor, d: usize) -> Result<(Tensor, Vec<f32>, Vec<f32>)> {
    let n = qkv.shape().rows();
    let mut q = Vec::with_capacity(n * d);
    let mut k = Vec::with_capacity(n * d);
    let mut v = Vec::with_capacity(n * d);
    for i in 0..n {
        let row = qkv.row(i)?;
        q.extend_from_slice(&row[..d]);
        k.extend_from_slice(&row[d..2 * d]);
        v.extend_from_slice(&row[2 * d..3 * d]);
    }
    Ok((Tensor::new(q, Shape::new(vec![n, d])), k, v))
}

/// Causal multi-head attention of `n` new queries against the cached history
/// of `n_past + n` keys and values.
fn attention(q: &Tensor, cache: &KvCache, layer: usize, n_past: usize, n: usize, n_head: usize) -> Result<Tensor> {
    let d = q.shape().row_len();
    let hd = d / n_head;
    let total = n_past + n;
    let scale = 1.0 / (hd as f32).sqrt();
    let (keys, values) = cache.read_view(layer, 0, total)?;
    let q = q.f32_data()?;

    let heads: Vec<Vec<f32>> = (0..n_head)
        .into_par_iter()
        .map(|h| {
            let mut out = vec![0.0f32; n * hd];
            let mut scores = vec![0.0f32; total];
            for i in 0..n {
                let qi = &q[i * d + h * hd..i * d + (h + 1) * hd];
                for (j, s) in scores.iter_mut().enumerate() {
                    *s = if j > n_past + i {
                        f32::NEG_INFINITY
                    } else {
                        dot(qi, &keys[j * d + h * hd..j * d + (h + 1) * hd]) * scale
                    };
                }
                softmax_in_place(&mut scores);

                let oi = &mut out[i * hd..(i + 1) * hd];
                for (j, &p) in scores.iter().enumerate().take(n_past + i + 1) {
                    let vj = &values[j * d + h * hd..j * d + (h + 1) * hd];
                    for (o, &v) in oi.iter_mut().zip(vj) {
                        *o += p * v;
                    }
                }
            }
            out
        })
        .collect();

    let mut merged = vec![0.0f32; n * d];
    for (h, head) in heads.iter().enumerate() {
        for i in 0..n {
            merged[i * d + h * hd..i * d + (h + 1) * hd].copy_from_slice(&head[i * hd..(i + 1) * hd]);
        }
    }

    Ok(Tensor::new(merged, Shape::new(vec![n, d])))
}
