//! Helpers shared by the unit tests.

use crate::crf::CRF;
use anyhow::Result;
use candle_core::{utils, DType, Device, Tensor};
use itertools::Itertools;

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const OK_TYPES: [DType; 2] = [DType::F32, DType::F64];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const OK_TYPES: [DType; 4] = [DType::F32, DType::F64, DType::F16, DType::BF16];

#[cfg(any(feature = "cuda", feature = "metal"))]
pub(crate) const FAIL_TYPES: [DType; 5] =
    [DType::U8, DType::U32, DType::I64, DType::F16, DType::BF16];
#[cfg(not(any(feature = "cuda", feature = "metal")))]
pub(crate) const FAIL_TYPES: [DType; 3] = [DType::U8, DType::U32, DType::I64];

/// Reference values from pytorch-crf are printed with 4 decimals.
pub(crate) const PYTORCH_CRF_EPSILON: f64 = 1e-3;

pub(crate) fn epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => 1e-6,
        DType::F32 => 1e-4,
        DType::F16 => 1e-2,
        DType::BF16 => 1e-1,
        _ => panic!("dtype not supported"),
    }
}

pub(crate) fn assert_close(a: f64, b: f64, epsilon: f64) {
    assert!((a - b).abs() <= epsilon, "{} and {} differ by more than {}", a, b, epsilon);
}

pub(crate) fn use_device() -> candle_core::Result<Device> {
    if cfg!(any(feature = "cuda", feature = "metal")) {
        if utils::cuda_is_available() {
            Device::new_cuda(0)
        } else if utils::metal_is_available() {
            Device::new_metal(0)
        } else {
            Ok(Device::Cpu)
        }
    } else {
        Ok(Device::Cpu)
    }
}

/// Build a CRF with fixed parameters.
pub(crate) fn make_crf<const N: usize>(
    batch_first: bool,
    start: &[f64; N],
    end: &[f64; N],
    transitions: &[[f64; N]; N],
    dtype: DType,
    device: &Device,
) -> candle_core::Result<CRF> {
    let mut crf = CRF::new_with_dtype(N, batch_first, dtype, device)?;
    crf.start_transitions = Tensor::new(start, device)?.to_dtype(dtype)?;
    crf.end_transitions = Tensor::new(end, device)?.to_dtype(dtype)?;
    crf.transitions = Tensor::new(transitions, device)?.to_dtype(dtype)?;
    Ok(crf)
}

/// Shared fixture: 3 timesteps, batch of 2, 5 tags, second sequence has length 2.
/// https://github.com/kmkurn/pytorch-crf/blob/623e3402d00a2728e99d6e8486010d67c754267b/tests/test_crf.py#L85
pub(crate) fn masked_fixture(
    dtype: DType,
    device: &Device,
) -> Result<(CRF, Tensor, Tensor, Tensor)> {
    let crf = make_crf(
        false,
        &[-0.0687, 0.0698, -0.0447, 0.0421, 0.0782],
        &[0.0061, -0.0671, -0.0797, 0.0629, -0.0136],
        &[
            [0.0489, -0.0002, 0.0619, 0.0458, 0.0662],
            [0.0707, 0.0297, -0.0422, 0.0831, -0.0038],
            [0.0439, 0.0178, -0.0754, 0.0260, 0.0681],
            [0.0191, 0.0755, 0.0230, 0.0209, -0.0768],
            [0.0303, 0.0592, -0.0297, 0.0681, 0.0801],
        ],
        dtype,
        device,
    )?;

    let emissions = Tensor::new(
        &[
            [
                [1.1699_f32, 1.1900, -0.7254, 0.1490, -1.4910],
                [-1.2101, 0.4538, 1.3654, 0.0135, -1.8480],
            ],
            [
                [0.5861, -0.1651, 0.9721, 0.4464, -0.5512],
                [-1.2701, -1.5360, 0.0037, 0.5853, -0.9926],
            ],
            [
                [-1.7625, 0.5437, 1.6322, -1.1274, -0.1313],
                [-0.9301, 0.8906, -2.6483, 0.5849, -1.1069],
            ],
        ],
        device,
    )?
    .to_dtype(dtype)?;

    let tags = Tensor::new(&[[2_i64, 4], [3, 3], [4, 2]], device)?;
    let mask = Tensor::new(&[[1_u8, 1, 1], [1, 1, 0]], device)?.transpose(0, 1)?;
    Ok((crf, emissions, tags, mask))
}

/// Emissions and tags of sequence `b`, cut to its masked length.
/// Inputs are laid out (seq, batch, ..).
pub(crate) fn masked_example(
    emissions: &Tensor,
    tags: &Tensor,
    mask: &Tensor,
    b: usize,
) -> Result<(Vec<Vec<f64>>, Vec<usize>)> {
    let emissions = emissions.to_dtype(DType::F64)?.to_vec3::<f64>()?;
    let tags = tags.contiguous()?.to_vec2::<i64>()?;
    let mask = mask.contiguous()?.to_vec2::<u8>()?;

    let len = mask.iter().filter(|row| row[b] != 0).count();
    let emission = emissions[..len].iter().map(|step| step[b].clone()).collect();
    let tag = tags[..len].iter().map(|step| step[b] as usize).collect();
    Ok((emission, tag))
}

/// Scores every possible tag sequence explicitly.
pub(crate) struct BruteForce {
    start: Vec<f64>,
    end: Vec<f64>,
    transitions: Vec<Vec<f64>>,
}

impl BruteForce {
    pub(crate) fn new(crf: &CRF) -> Result<Self> {
        Ok(Self {
            start: crf.start_transitions.to_dtype(DType::F64)?.to_vec1()?,
            end: crf.end_transitions.to_dtype(DType::F64)?.to_vec1()?,
            transitions: crf.transitions.to_dtype(DType::F64)?.to_vec2()?,
        })
    }

    pub(crate) fn score(&self, emission: &[Vec<f64>], path: &[usize]) -> f64 {
        let mut score = self.start[path[0]] + self.end[path[path.len() - 1]];
        for (&cur, &next) in path.iter().tuple_windows() {
            score += self.transitions[cur][next];
        }
        for (step, &tag) in emission.iter().zip(path.iter()) {
            score += step[tag];
        }
        score
    }

    fn all_paths(&self, len: usize) -> impl Iterator<Item = Vec<usize>> {
        let num_tags = self.start.len();
        (0..len).map(move |_| 0..num_tags).multi_cartesian_product()
    }

    pub(crate) fn log_likelihood(&self, emission: &[Vec<f64>], tags: &[usize]) -> f64 {
        let normalizer = self
            .all_paths(emission.len())
            .map(|path| self.score(emission, &path).exp())
            .sum::<f64>()
            .ln();
        self.score(emission, tags) - normalizer
    }

    pub(crate) fn best_path(&self, emission: &[Vec<f64>]) -> Vec<usize> {
        self.all_paths(emission.len())
            .max_by(|a, b| {
                self.score(emission, a)
                    .total_cmp(&self.score(emission, b))
            })
            .unwrap_or_default()
    }
}
