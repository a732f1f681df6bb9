//! Cached causal attention masks shared by the forward pass
//!
//! Masks are cached by `(seq_len, device_id, dtype)` to avoid recreating
//! large tensors on every forward pass. The cache uses shallow clones
//! (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// Type alias for the causal mask cache to reduce type complexity
type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

/// Cache for causal masks indexed by (seq_len, device_ordinal, dtype)
static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Get device identifier for cache key
///
/// Note: This simplified approach assumes a single device per type.
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Create or retrieve a cached causal mask for the given sequence length
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let cache_key = (seq_len, device_id(device), dtype);

    {
        let cache = CAUSAL_MASK_CACHE.lock().unwrap();
        if let Some(cached) = cache.get(&cache_key) {
            return Ok(cached.clone()); // Shallow clone (Arc bump, no data copy)
        }
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    {
        let mut cache = CAUSAL_MASK_CACHE.lock().unwrap();
        cache.insert(cache_key, mask_tensor.clone());
    }

    Ok(mask_tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask_shape_and_values() {
        let device = Device::Cpu;
        let mask = create_causal_mask(4, &device, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 4, 4]);

        let flat: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0 can only see position 0
        assert_eq!(flat[0], 0.0);
        assert_eq!(flat[1], f32::NEG_INFINITY);
        // Last row sees everything
        assert!(flat[12..16].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_causal_mask_cached() {
        let device = Device::Cpu;
        let a = create_causal_mask(7, &device, DType::F32).unwrap();
        let b = create_causal_mask(7, &device, DType::F32).unwrap();
        assert_eq!(a.dims(), b.dims());
    }
}
