//! Typed GPU buffers

use crate::backend::traits::*;
use crate::backend::types::*;
use bytemuck::Pod;
use std::marker::PhantomData;

/// Host-visible buffer holding `capacity` elements of `T`
#[derive(Debug)]
pub struct GpuBuffer<T: Pod> {
    handle: BufferHandle,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> GpuBuffer<T> {
    /// Zero-initialized buffer. A zero capacity still allocates one element
    /// so the buffer can be bound.
    pub fn new<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        capacity: usize,
        usage: BufferUsage,
    ) -> BackendResult<Self> {
        let capacity = capacity.max(1);
        let handle = backend.create_buffer(&BufferDescriptor {
            label: Some(label.to_string()),
            size: (capacity * std::mem::size_of::<T>()) as u64,
            usage,
            mapped_at_creation: false,
        })?;
        log::debug!(
            "Created buffer '{}' ({} x {} bytes)",
            label,
            capacity,
            std::mem::size_of::<T>()
        );
        Ok(Self {
            handle,
            capacity,
            _marker: PhantomData,
        })
    }

    /// Buffer sized to and filled with `data`
    pub fn with_data<B: GraphicsBackend>(
        backend: &mut B,
        label: &str,
        data: &[T],
        usage: BufferUsage,
    ) -> BackendResult<Self> {
        let buffer = Self::new(backend, label, data.len(), usage)?;
        buffer.write(backend, 0, data)?;
        Ok(buffer)
    }

    /// Write `data` starting at element `first`
    pub fn write<B: GraphicsBackend>(
        &self,
        backend: &mut B,
        first: usize,
        data: &[T],
    ) -> BackendResult<()> {
        if first + data.len() > self.capacity {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} elements at {} exceeds capacity {}",
                data.len(),
                first,
                self.capacity
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        backend.write_buffer(
            self.handle,
            (first * std::mem::size_of::<T>()) as u64,
            bytemuck::cast_slice(data),
        )
    }

    /// Read back every element
    pub fn read<B: GraphicsBackend>(&self, backend: &B) -> BackendResult<Vec<T>> {
        let bytes = backend.read_buffer(self.handle, 0, self.byte_size())?;
        Ok(bytemuck::pod_collect_to_vec(&bytes))
    }

    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn byte_size(&self) -> u64 {
        (self.capacity * std::mem::size_of::<T>()) as u64
    }

    /// Bind group entry covering the whole buffer
    pub fn binding(&self) -> BindGroupEntry {
        BindGroupEntry::Buffer {
            buffer: self.handle,
            offset: 0,
            size: None,
        }
    }

    pub fn destroy<B: GraphicsBackend>(self, backend: &mut B) {
        backend.destroy_buffer(self.handle);
    }
}

#[cfg(all(test, feature = "headless"))]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_write_respects_capacity() {
        let mut backend = HeadlessBackend::default();
        let buffer =
            GpuBuffer::<u32>::new(&mut backend, "counts", 4, BufferUsage::STORAGE).unwrap();
        buffer.write(&mut backend, 2, &[7, 9]).unwrap();
        assert_eq!(buffer.read(&backend).unwrap(), vec![0, 0, 7, 9]);
        assert!(buffer.write(&mut backend, 3, &[1, 2]).is_err());
    }

    #[test]
    fn test_empty_buffer_keeps_one_element() {
        let mut backend = HeadlessBackend::default();
        let buffer =
            GpuBuffer::<[f32; 4]>::with_data(&mut backend, "empty", &[], BufferUsage::STORAGE)
                .unwrap();
        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.byte_size(), 16);
        buffer.destroy(&mut backend);
        assert_eq!(backend.live_objects().buffers, 0);
    }
}
