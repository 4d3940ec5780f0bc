use crate::layer::{Layer, Prediction, Provenance};
use candle_core::{shape::Dim, DType, Device, Error, IndexOp, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, trace};

const INIT_LO: f64 = -0.1;
const INIT_UP: f64 = 1.0;

/// Reduction Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    None,
    Sum,
    Mean,
    TokenMean,
}

impl Default for Reduction {
    fn default() -> Self {
        Reduction::Sum
    }
}

// -----------------------------------------------------------------------------

fn default_use_boundary() -> bool {
    true
}

fn default_name() -> String {
    "crf".to_string()
}

/// Serializable description of a [`CRF`] layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrfConfig {
    pub num_tags: usize,
    #[serde(default)]
    pub batch_first: bool,
    /// Learn start/end energies. When off they are fixed at zero.
    #[serde(default = "default_use_boundary")]
    pub use_boundary: bool,
    #[serde(default = "default_name")]
    pub name: String,
}

impl CrfConfig {
    pub fn new(num_tags: usize, batch_first: bool) -> Self {
        Self {
            num_tags,
            batch_first,
            use_boundary: default_use_boundary(),
            name: default_name(),
        }
    }

    pub fn with_boundary(mut self, use_boundary: bool) -> Self {
        self.use_boundary = use_boundary;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// -----------------------------------------------------------------------------

/// CRF
/// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L9
pub struct CRF {
    pub(crate) name: String,
    pub(crate) num_tags: usize,
    pub(crate) batch_first: bool,
    pub(crate) use_boundary: bool,

    pub(crate) start_transitions: Tensor,
    pub(crate) end_transitions: Tensor,
    pub(crate) transitions: Tensor,
}

impl Display for CRF {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: CRF(num_tags: {}, batch_first: {}, use_boundary: {})",
            self.name, self.num_tags, self.batch_first, self.use_boundary
        )
    }
}

impl Layer for CRF {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn check_dtype(dtype: DType) -> Result<()> {
    use DType::*;
    match dtype {
        #[cfg(any(feature = "cuda", feature = "metal"))]
        F32 | F64 => Ok(()),
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        BF16 | F16 | F32 | F64 => Ok(()),
        _ => Err(Error::UnsupportedDTypeForOp(dtype, "unsupported dtype")),
    }
}

impl CRF {
    /// Create a new CRF
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L38
    pub fn new(num_tags: usize, batch_first: bool, device: &Device) -> Result<Self> {
        Self::new_with_dtype(num_tags, batch_first, DType::F32, device)
    }

    pub fn new_with_dtype(
        num_tags: usize,
        batch_first: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::from_config(&CrfConfig::new(num_tags, batch_first), dtype, device)
    }

    pub fn from_config(config: &CrfConfig, dtype: DType, device: &Device) -> Result<Self> {
        check_dtype(dtype)?;
        let num_tags = config.num_tags;
        if num_tags == 0 {
            return Err(Error::Msg("num_tags must be greater than 0".to_string()));
        }

        let (start_transitions, end_transitions) = if config.use_boundary {
            (
                Tensor::zeros(num_tags, dtype, device)?.rand_like(INIT_LO, INIT_UP)?,
                Tensor::zeros(num_tags, dtype, device)?.rand_like(INIT_LO, INIT_UP)?,
            )
        } else {
            (
                Tensor::zeros(num_tags, dtype, device)?,
                Tensor::zeros(num_tags, dtype, device)?,
            )
        };
        let transitions =
            Tensor::zeros((num_tags, num_tags), dtype, device)?.rand_like(INIT_LO, INIT_UP)?;

        debug!(
            name = %config.name,
            num_tags,
            batch_first = config.batch_first,
            use_boundary = config.use_boundary,
            ?dtype,
            "created CRF layer"
        );

        Ok(Self {
            name: config.name.clone(),
            num_tags,
            batch_first: config.batch_first,
            use_boundary: config.use_boundary,
            start_transitions,
            end_transitions,
            transitions,
        })
    }

    pub fn load(num_tags: usize, batch_first: bool, vb: VarBuilder) -> Result<Self> {
        Self::load_with_config(&CrfConfig::new(num_tags, batch_first), vb)
    }

    /// Load the parameters through `vb`, initialising missing ones uniformly.
    pub fn load_with_config(config: &CrfConfig, vb: VarBuilder) -> Result<Self> {
        let num_tags = config.num_tags;
        if num_tags == 0 {
            return Err(Error::Msg("num_tags must be greater than 0".to_string()));
        }
        let init = Init::Uniform {
            lo: INIT_LO,
            up: INIT_UP,
        };

        let (start_transitions, end_transitions) = if config.use_boundary {
            (
                vb.get_with_hints(num_tags, "start_transitions", init)?,
                vb.get_with_hints(num_tags, "end_transitions", init)?,
            )
        } else {
            (
                Tensor::zeros(num_tags, vb.dtype(), vb.device())?,
                Tensor::zeros(num_tags, vb.dtype(), vb.device())?,
            )
        };
        let transitions = vb.get_with_hints((num_tags, num_tags), "transitions", init)?;

        debug!(name = %config.name, num_tags, "loaded CRF layer");

        Ok(Self {
            name: config.name.clone(),
            num_tags,
            batch_first: config.batch_first,
            use_boundary: config.use_boundary,
            start_transitions,
            end_transitions,
            transitions,
        })
    }

    pub fn config(&self) -> CrfConfig {
        CrfConfig {
            num_tags: self.num_tags,
            batch_first: self.batch_first,
            use_boundary: self.use_boundary,
            name: self.name.clone(),
        }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn batch_first(&self) -> bool {
        self.batch_first
    }

    pub fn transitions(&self) -> &Tensor {
        &self.transitions
    }

    /// validate
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L142
    fn validate(
        &self,
        emissions: &Tensor,
        tags: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<()> {
        let dtype = self.transitions.dtype();
        if emissions.dtype() != dtype {
            return Err(Error::Msg(format!(
                "emissions and CRF must have the same dtype, expected {:?}, got {:?}",
                dtype,
                emissions.dtype()
            )));
        }

        let rank = emissions.rank();
        if rank != 3 {
            return Err(Error::Msg(format!(
                "emissions must have 3 dimensions, got {}",
                rank
            )));
        }

        let (d1, d2, d3) = emissions.dims3()?;
        if d3 != self.num_tags {
            return Err(Error::Msg(format!(
                "expected last dimension of emissions is {}, got {}",
                self.num_tags, d3
            )));
        }

        if let Some(tags) = tags {
            if tags.dtype() != DType::I64 {
                return Err(Error::Msg("tags must be of type i64".to_string()));
            }
            if tags.rank() != 2 {
                return Err(Error::Msg(format!(
                    "tags must have 2 dimensions, got {}",
                    tags.rank()
                )));
            }
            let (tag_d1, tag_d2) = tags.dims2()?;
            if (d1, d2) != (tag_d1, tag_d2) {
                return Err(Error::Msg(format!(
                    "the first two dimensions of emissions and tags must match, got ({}, {}) and ({}, {})",
                    d1, d2, tag_d1, tag_d2
                )));
            }
        }

        if let Some(mask) = mask {
            if mask.dtype() != DType::U8 {
                return Err(Error::Msg("mask must be of type u8".to_string()));
            }
            if mask.rank() != 2 {
                return Err(Error::Msg(format!(
                    "mask must have 2 dimensions, got {}",
                    mask.rank()
                )));
            }
            let (mask_d1, mask_d2) = mask.dims2()?;
            if (d1, d2) != (mask_d1, mask_d2) {
                return Err(Error::Msg(format!(
                    "the first two dimensions of emissions and mask must match, got ({}, {}) and ({}, {})",
                    d1, d2, mask_d1, mask_d2
                )));
            }

            let first = if self.batch_first {
                mask.i((.., 0))?
            } else {
                mask.i(0)?
            };
            if !all(&first)? {
                return Err(Error::Msg(
                    "mask of the first timestep must all be on".to_string(),
                ));
            }

            let max = mask.flatten_all()?.max(0)?.to_scalar::<u8>()?;
            if max > 1 {
                return Err(Error::Msg(format!(
                    "mask must only contain 0 or 1, got {}",
                    max
                )));
            }
        }

        Ok(())
    }

    /// compute_score
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L172
    fn compute_score(&self, emissions: &Tensor, tags: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (seq_length, batch_size) = tags.dims2()?;
        debug_assert_eq!(emissions.dims3()?, (seq_length, batch_size, self.num_tags));
        debug_assert_eq!(mask.shape(), tags.shape());

        let mask = mask.to_dtype(emissions.dtype())?;

        let mut score = self.start_transitions.i(&tags.i(0)?)?;
        let z = gather(&emissions.i((0, 0..batch_size))?, &tags.i(0)?)?;
        score = score.broadcast_add(&z)?;

        for i in 1..seq_length {
            let z = gather(&self.transitions.i(&tags.i(i - 1)?)?, &tags.i(i)?)?;
            score = score.broadcast_add(&z.broadcast_mul(&mask.i(i)?)?)?;

            let z = gather(&emissions.i((i, 0..batch_size))?, &tags.i(i)?)?;
            score = score.broadcast_add(&z.broadcast_mul(&mask.i(i)?)?)?;
        }

        let seq_ends = seq_ends(&mask)?;
        let last_tags = gather(
            &tags.i(&seq_ends)?,
            &Tensor::arange(0, batch_size as i64, mask.device())?,
        )?;

        score.broadcast_add(&self.end_transitions.i(&last_tags)?)
    }

    /// compute_normalizer
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L211
    fn compute_normalizer(&self, emissions: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (seq_length, batch_size) = mask.dims2()?;
        debug_assert_eq!(emissions.dims3()?, (seq_length, batch_size, self.num_tags));

        let mut score = self.start_transitions.broadcast_add(&emissions.i(0)?)?;

        for i in 1..seq_length {
            let next_score = score
                .unsqueeze(2)?
                .broadcast_add(&self.transitions)?
                .broadcast_add(&emissions.i(i)?.unsqueeze(1)?)?
                .log_sum_exp(1)?;

            let on = mask.i(i)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            score = on.where_cond(&next_score, &score)?;
        }

        score.broadcast_add(&self.end_transitions)?.log_sum_exp(1)
    }

    /// viterbi_decode
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L262
    fn viterbi_decode(&self, emissions: &Tensor, mask: &Tensor) -> Result<Vec<Vec<u32>>> {
        let (seq_length, batch_size) = mask.dims2()?;
        debug_assert_eq!(emissions.dims3()?, (seq_length, batch_size, self.num_tags));

        let mut score = self.start_transitions.broadcast_add(&emissions.i(0)?)?;

        let mut history = Vec::with_capacity(seq_length.saturating_sub(1));
        for i in 1..seq_length {
            let next_score = score
                .unsqueeze(2)?
                .broadcast_add(&self.transitions)?
                .broadcast_add(&emissions.i(i)?.unsqueeze(1)?)?;

            let (next_score, indices) = max_indices(&next_score, 1)?;

            let on = mask.i(i)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            score = on.where_cond(&next_score, &score)?;
            history.push(indices);
        }

        score = score.broadcast_add(&self.end_transitions)?;
        let seq_ends = seq_ends(mask)?.to_vec1::<i64>()?;

        let mut best_tags_list = Vec::with_capacity(batch_size);
        for (idx, &seq_end) in seq_ends.iter().enumerate() {
            let mut last_tag = score.i(idx)?.argmax(0)?.to_scalar::<u32>()?;
            let mut best_tags = vec![last_tag];

            for hist in history[..seq_end as usize].iter().rev() {
                last_tag = hist.i((idx, last_tag as usize))?.to_scalar::<u32>()?;
                best_tags.push(last_tag);
            }

            best_tags.reverse();
            best_tags_list.push(best_tags);
        }

        Ok(best_tags_list)
    }

    /// Put emissions, tags and mask in (seq, batch, ..) order.
    fn time_major(&self, t: &Tensor) -> Result<Tensor> {
        if self.batch_first {
            t.transpose(0, 1)
        } else {
            Ok(t.clone())
        }
    }

    /// decode
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L118
    pub fn decode(&self, emissions: &Tensor, mask: Option<&Tensor>) -> Result<Vec<Vec<u32>>> {
        self.validate(emissions, None, mask)?;
        let mask = match mask {
            Some(mask) => mask.clone(),
            None => {
                let (d1, d2, _) = emissions.dims3()?;
                Tensor::ones((d1, d2), DType::U8, emissions.device())?
            }
        };

        let best_tags =
            self.viterbi_decode(&self.time_major(emissions)?, &self.time_major(&mask)?)?;
        trace!(name = %self.name, batch_size = best_tags.len(), "viterbi decoded");
        Ok(best_tags)
    }

    /// Forward
    /// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/torchcrf/__init__.py#L63
    pub fn forward(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: Option<&Tensor>,
        reduction: Reduction,
    ) -> Result<Tensor> {
        self.validate(emissions, Some(tags), mask)?;
        let mask = match mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones_like(tags)?.to_dtype(DType::U8)?,
        };

        let emissions = self.time_major(emissions)?;
        let tags = self.time_major(tags)?;
        let mask = self.time_major(&mask)?;

        let numerator = self.compute_score(&emissions, &tags, &mask)?;
        let denominator = self.compute_normalizer(&emissions, &mask)?;

        let llh = numerator.broadcast_sub(&denominator)?;

        match reduction {
            Reduction::Sum => llh.sum_all(),
            Reduction::Mean => llh.mean_all(),
            Reduction::TokenMean => {
                let mask = mask.to_dtype(llh.dtype())?;
                let z = mask.sum_all()?;
                llh.sum_all()?.broadcast_div(&z)
            }
            Reduction::None => Ok(llh),
        }
    }

    /// Decode `emissions` and return the best tags as an `I64` tensor laid out
    /// like the `tags` argument of [`CRF::forward`], recording this layer as
    /// the producer. Positions past a sequence's end hold tag 0.
    pub fn apply(
        self: &Arc<Self>,
        emissions: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Prediction> {
        let best_tags = self.decode(emissions, mask)?;
        let (d1, d2, _) = emissions.dims3()?;
        let (batch_size, seq_length) = if self.batch_first { (d1, d2) } else { (d2, d1) };

        let mut padded = vec![0_i64; batch_size * seq_length];
        for (b, tags) in best_tags.iter().enumerate() {
            for (t, &tag) in tags.iter().enumerate() {
                padded[b * seq_length + t] = tag as i64;
            }
        }

        let values = Tensor::from_vec(padded, (batch_size, seq_length), emissions.device())?;
        let values = if self.batch_first {
            values
        } else {
            values.transpose(0, 1)?.contiguous()?
        };

        let layer: Arc<dyn Layer> = self.clone();
        let provenance = Provenance::new(layer, vec![emissions.clone()], mask.cloned());
        Ok(Prediction::with_provenance(values, provenance))
    }

    /// Per-example negative log-likelihood of `y_true`, using the emissions
    /// and mask this layer saw when it produced `y_pred`.
    ///
    /// `y_true` holds tag indices laid out like `tags`, or one-hot targets
    /// with a trailing `num_tags` axis.
    pub fn get_loss(&self, y_true: &Tensor, y_pred: &Prediction) -> Result<Tensor> {
        let provenance = y_pred
            .provenance()
            .ok_or_else(|| Error::Msg("predictions were not produced by a layer".to_string()))?;
        let emissions = provenance
            .inputs()
            .first()
            .ok_or_else(|| Error::Msg("predictions carry no emissions".to_string()))?;

        let tags = self.sparse_targets(y_true)?;
        let llh = self.forward(emissions, &tags, provenance.mask(), Reduction::None)?;
        llh.neg()
    }

    fn sparse_targets(&self, y_true: &Tensor) -> Result<Tensor> {
        if y_true.rank() != 3 {
            return y_true.to_dtype(DType::I64);
        }
        let depth = y_true.dim(D::Minus1)?;
        if depth != self.num_tags {
            return Err(Error::Msg(format!(
                "expected last dimension of one-hot targets is {}, got {}",
                self.num_tags, depth
            )));
        }
        y_true.argmax(D::Minus1)?.to_dtype(DType::I64)
    }
}

// -----------------------------------------------------------------------------

/// Index of the last unmasked timestep of every sequence in a (seq, batch) mask.
fn seq_ends(mask: &Tensor) -> Result<Tensor> {
    mask.to_dtype(DType::I64)?
        .sum(0)?
        .broadcast_sub(&Tensor::ones(1, DType::I64, mask.device())?)
}

pub(crate) fn all(x: &Tensor) -> Result<bool> {
    let zero = x.zeros_like()?;
    Ok(x.broadcast_ne(&zero)?
        .flatten_all()?
        .min(0)?
        .to_scalar::<u8>()?
        != 0)
}

pub(crate) fn gather(src: &Tensor, idx: &Tensor) -> Result<Tensor> {
    let index = idx.reshape((idx.dim(0)?, 1))?;
    src.gather(&index, D::Minus1)?.squeeze(D::Minus1)
}

pub(crate) fn max_indices<D: Dim + Copy>(x: &Tensor, dim: D) -> Result<(Tensor, Tensor)> {
    let max = x.max(dim)?;
    let idx = x.argmax(dim)?;
    Ok((max, idx))
}

// -----------------------------------------------------------------------------
