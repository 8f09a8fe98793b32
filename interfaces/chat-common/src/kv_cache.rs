use candle_core::Tensor;

/// A growable key/value cache for one attention layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    key: TensorCache,
    value: TensorCache,
}

impl KvCache {
    /// Create a new cache with the given max sequence length.
    pub fn new(concat_dim: usize, max_seq_len: usize) -> Self {
        Self {
            key: TensorCache::new(concat_dim, max_seq_len),
            value: TensorCache::new(concat_dim, max_seq_len),
        }
    }

    /// The number of positions currently held in the cache.
    pub fn current_seq_len(&self) -> usize {
        self.key.current_seq_len
    }

    /// Reset the cache.
    pub fn reset(&mut self) {
        self.key.reset();
        self.value.reset();
    }

    /// Append a new key/value pair to the cache and return everything cached so far.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> candle_core::Result<(Tensor, Tensor)> {
        let k = self.key.append(k)?;
        let v = self.value.append(v)?;
        Ok((k, v))
    }
}

/// A tensor cache that doubles its allocation as the sequence grows, up to a fixed maximum.
#[derive(Debug, Clone)]
pub struct TensorCache {
    all_data: Option<Tensor>,
    current_seq_len: usize,
    allocated_seq_len: usize,
    concat_dim: usize,
    max_seq_len: usize,
}

impl TensorCache {
    /// Create a new cache with the given max sequence length.
    pub fn new(concat_dim: usize, max_seq_len: usize) -> Self {
        Self {
            all_data: None,
            current_seq_len: 0,
            allocated_seq_len: 0,
            concat_dim,
            max_seq_len,
        }
    }

    /// Get the current data in the cache.
    pub fn current_data(&self) -> candle_core::Result<Option<Tensor>> {
        let data = match self.all_data.as_ref() {
            None => None,
            Some(d) => Some(
                d.narrow(self.concat_dim, 0, self.current_seq_len)?
                    .contiguous()?,
            ),
        };
        Ok(data)
    }

    /// Reset the cache.
    pub fn reset(&mut self) {
        self.all_data = None;
        self.current_seq_len = 0;
        self.allocated_seq_len = 0;
    }

    /// Append a new value to the cache and return the cached data including it.
    pub fn append(&mut self, v: &Tensor) -> candle_core::Result<Tensor> {
        let v = v.contiguous()?;
        let seq_len = v.dim(self.concat_dim)?;
        let size_required_for_append = self.current_seq_len + seq_len;

        if size_required_for_append > self.max_seq_len {
            candle_core::bail!(
                "kv cache overflow: {size_required_for_append} positions requested but the cache holds {}",
                self.max_seq_len
            );
        }

        if size_required_for_append > self.allocated_seq_len {
            // Keep the allocation a power of two, capped at the max sequence length.
            let new_allocated_seq_len = size_required_for_append
                .next_power_of_two()
                .min(self.max_seq_len);
            tracing::trace!(
                "Extending tensor cache from {} to {new_allocated_seq_len}",
                self.allocated_seq_len
            );

            let mut tensors = Vec::new();
            if let Some(data) = &self.all_data {
                tensors.push(data.clone());
            }
            let mut shape = v.shape().dims().to_vec();
            shape[self.concat_dim] = new_allocated_seq_len - self.allocated_seq_len;
            tensors.push(Tensor::zeros(shape.as_slice(), v.dtype(), v.device())?);
            self.all_data = Some(Tensor::cat(&tensors, self.concat_dim)?);
            self.allocated_seq_len = new_allocated_seq_len;
        }

        let Some(all_data) = self.all_data.as_mut() else {
            candle_core::bail!("tensor cache has no allocation after growing");
        };
        all_data.slice_set(&v, self.concat_dim, self.current_seq_len)?;
        self.current_seq_len += seq_len;

        match self.current_data()? {
            Some(data) => Ok(data),
            None => candle_core::bail!("tensor cache is empty after an append"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn appends_concatenate_along_the_sequence_dimension() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(2, 8);

        let first = Tensor::arange(0f32, 6., &device)
            .unwrap()
            .reshape((1, 1, 3, 2))
            .unwrap();
        let (k, v) = cache.append(&first, &first).unwrap();
        assert_eq!(k.dims(), &[1, 1, 3, 2]);
        assert_eq!(v.dims(), &[1, 1, 3, 2]);

        let second = Tensor::new(&[6f32, 7.], &device)
            .unwrap()
            .reshape((1, 1, 1, 2))
            .unwrap();
        let (k, _) = cache.append(&second, &second).unwrap();
        assert_eq!(k.dims(), &[1, 1, 4, 2]);
        assert_eq!(cache.current_seq_len(), 4);
        assert_eq!(
            k.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![0., 1., 2., 3., 4., 5., 6., 7.]
        );
    }

    #[test]
    fn appending_past_the_maximum_is_an_error() {
        let device = Device::Cpu;
        let mut cache = KvCache::new(2, 2);
        let step = Tensor::zeros((1, 1, 2, 4), candle_core::DType::F32, &device).unwrap();
        cache.append(&step, &step).unwrap();
        assert!(cache.append(&step, &step).is_err());

        cache.reset();
        assert_eq!(cache.current_seq_len(), 0);
        assert!(cache.append(&step, &step).is_ok());
    }
}
