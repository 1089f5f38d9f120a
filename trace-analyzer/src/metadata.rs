//! Indexes thread-to-GPU-device/context bindings and per-device properties
//! from the attribute stream. Grow-only for the lifetime of the stream;
//! only the provenance gatherer reads it.

use rustc_hash::FxHashMap;

use trace_model::ThreadId;

use crate::error::{AnalysisError, Result};

/// One metadata record as delivered alongside a step: the thread it concerns,
/// a key such as `"CUDA Context"` or `"GPU[9] Clock Rate"`, and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRecord {
    pub thread_id: ThreadId,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBinding {
    pub device: u32,
    pub context: u32,
}

#[derive(Debug, Default)]
pub struct MetadataRegistry {
    gpu_threads: FxHashMap<ThreadId, GpuBinding>,
    // Devices and contexts are reported as separate records for the same
    // thread; we stage them here until both halves of a binding arrive.
    pending_device: FxHashMap<ThreadId, u32>,
    pending_context: FxHashMap<ThreadId, u32>,
    gpu_properties: FxHashMap<u32, FxHashMap<String, String>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data(&mut self, records: &[MetadataRecord]) -> Vec<AnalysisError> {
        let mut errors = Vec::new();
        for record in records {
            if let Err(e) = self.add_one(record) {
                errors.push(e);
            }
        }
        errors
    }

    fn add_one(&mut self, record: &MetadataRecord) -> Result<()> {
        if record.key == "CUDA Context" {
            let context: u32 = record
                .value
                .parse()
                .map_err(|_| AnalysisError::InvalidInput(format!("bad CUDA Context value: {}", record.value)))?;
            self.pending_context.insert(record.thread_id, context);
            self.try_complete_binding(record.thread_id);
            Ok(())
        } else if record.key == "CUDA Device" {
            let device: u32 = record
                .value
                .parse()
                .map_err(|_| AnalysisError::InvalidInput(format!("bad CUDA Device value: {}", record.value)))?;
            self.pending_device.insert(record.thread_id, device);
            self.try_complete_binding(record.thread_id);
            Ok(())
        } else if let Some(rest) = record.key.strip_prefix("GPU[") {
            let (device_str, property) = rest
                .split_once(']')
                .ok_or_else(|| AnalysisError::InvalidInput(format!("malformed GPU property key: {}", record.key)))?;
            let device: u32 = device_str
                .parse()
                .map_err(|_| AnalysisError::InvalidInput(format!("malformed GPU device index: {device_str}")))?;
            let property = property.trim_start();
            self.gpu_properties
                .entry(device)
                .or_default()
                .insert(property.to_string(), record.value.clone());
            Ok(())
        } else {
            // Unrecognised keys are not this component's concern; only CUDA
            // Context/Device and GPU[d] properties are parsed here.
            Ok(())
        }
    }

    fn try_complete_binding(&mut self, thread_id: ThreadId) {
        if let (Some(&device), Some(&context)) = (
            self.pending_device.get(&thread_id),
            self.pending_context.get(&thread_id),
        ) {
            self.gpu_threads
                .insert(thread_id, GpuBinding { device, context });
        }
    }

    pub fn is_gpu_thread(&self, thread_id: ThreadId) -> bool {
        self.gpu_threads.contains_key(&thread_id)
    }

    pub fn gpu_binding(&self, thread_id: ThreadId) -> Option<GpuBinding> {
        self.gpu_threads.get(&thread_id).copied()
    }

    pub fn gpu_properties(&self, device: u32) -> Option<&FxHashMap<String, String>> {
        self.gpu_properties.get(&device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cuda_device_and_context_in_either_order() {
        let mut reg = MetadataRegistry::new();
        let records = vec![
            MetadataRecord {
                thread_id: 9,
                key: "CUDA Context".to_string(),
                value: "1".to_string(),
            },
            MetadataRecord {
                thread_id: 9,
                key: "CUDA Device".to_string(),
                value: "2".to_string(),
            },
        ];
        assert!(reg.add_data(&records).is_empty());
        assert!(reg.is_gpu_thread(9));
        let binding = reg.gpu_binding(9).unwrap();
        assert_eq!(binding.device, 2);
        assert_eq!(binding.context, 1);
    }

    #[test]
    fn parses_gpu_properties() {
        let mut reg = MetadataRegistry::new();
        let records = vec![
            MetadataRecord {
                thread_id: 1234,
                key: "GPU[9] Clock Rate".to_string(),
                value: "98765".to_string(),
            },
            MetadataRecord {
                thread_id: 1234,
                key: "GPU[9] Name".to_string(),
                value: "NVidia Deathstar".to_string(),
            },
        ];
        assert!(reg.add_data(&records).is_empty());
        let props = reg.gpu_properties(9).unwrap();
        assert_eq!(props.get("Clock Rate").unwrap(), "98765");
        assert_eq!(props.get("Name").unwrap(), "NVidia Deathstar");
    }
}
