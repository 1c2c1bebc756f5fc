// dbvault/src/processor/mod.rs
//! Reversible transforms applied to a backup on its way to storage.
//!
//! Processors are ordered by precedence: `process` wraps the stream in
//! ascending precedence, so the lowest-precedence processor touches the raw
//! dump first. `deprocess` resolves the same order and peels the layers off
//! from the outermost one, which makes it the exact inverse.

pub mod compressor;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{AppError, Result};
use crate::stream::BackupStream;

pub use compressor::BackupCompressor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorType {
    Compressor,
}

impl ProcessorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorType::Compressor => "compressor",
        }
    }
}

impl FromStr for ProcessorType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compressor" => Ok(ProcessorType::Compressor),
            other => Err(AppError::UnknownProcessor(other.to_string())),
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stateless stream transform and its inverse.
pub trait Processor: Send + Sync {
    fn processor_type(&self) -> ProcessorType;

    /// Lower values are applied closer to the raw dump.
    fn precedence(&self) -> u32;

    fn process(&self, input: BackupStream) -> BackupStream;

    fn deprocess(&self, input: BackupStream) -> BackupStream;
}

pub struct BackupProcessorManager {
    processors: HashMap<ProcessorType, Arc<dyn Processor>>,
}

impl BackupProcessorManager {
    pub fn new(processors: Vec<Arc<dyn Processor>>) -> Self {
        let processors = processors
            .into_iter()
            .map(|p| (p.processor_type(), p))
            .collect();
        BackupProcessorManager { processors }
    }

    /// Registry holding every built-in processor.
    pub fn with_defaults() -> Self {
        let compressor: Arc<dyn Processor> = Arc::new(BackupCompressor::default());
        BackupProcessorManager::new(vec![compressor])
    }

    /// Looks up `names`, drops duplicates and sorts by ascending precedence.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Processor>>> {
        let mut seen = Vec::with_capacity(names.len());
        let mut resolved: Vec<Arc<dyn Processor>> = Vec::with_capacity(names.len());
        for name in names {
            let processor_type: ProcessorType = name.parse()?;
            if seen.contains(&processor_type) {
                continue;
            }
            let processor = self
                .processors
                .get(&processor_type)
                .ok_or_else(|| AppError::UnknownProcessor(name.clone()))?;
            seen.push(processor_type);
            resolved.push(processor.clone());
        }
        resolved.sort_by_key(|p| p.precedence());
        Ok(resolved)
    }

    pub fn validate(&self, names: &[String]) -> Result<()> {
        self.resolve(names).map(|_| ())
    }

    pub fn process(&self, stream: BackupStream, names: &[String]) -> Result<BackupStream> {
        let processors = self.resolve(names)?;
        let mut stream = stream;
        for processor in &processors {
            debug!(processor = %processor.processor_type(), "Applying processor");
            stream = processor.process(stream);
        }
        Ok(stream)
    }

    pub fn deprocess(&self, stream: BackupStream, names: &[String]) -> Result<BackupStream> {
        let processors = self.resolve(names)?;
        let mut stream = stream;
        // Reverse of `process`: the last layer wrapped is the first one read.
        // With a single processor type this matches the forward order.
        for processor in processors.iter().rev() {
            debug!(processor = %processor.processor_type(), "Applying deprocessor");
            stream = processor.deprocess(stream);
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    async fn round_trip(input: Vec<u8>, names: &[String]) -> anyhow::Result<Vec<u8>> {
        let manager = BackupProcessorManager::with_defaults();
        let processed = manager.process(Box::pin(Cursor::new(input)), names)?;
        let mut restored = manager.deprocess(processed, names)?;
        let mut out = Vec::new();
        restored.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Deterministic, poorly compressible bytes.
    fn noise(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_empty_small_and_large() -> anyhow::Result<()> {
        let names = vec!["compressor".to_string()];
        assert!(round_trip(Vec::new(), &names).await?.is_empty());

        let small = b"CREATE TABLE t (id int);\n".to_vec();
        assert_eq!(round_trip(small.clone(), &names).await?, small);

        let large = noise(3 * 1024 * 1024 / 2);
        assert_eq!(round_trip(large.clone(), &names).await?, large);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_names_apply_once() -> anyhow::Result<()> {
        let manager = BackupProcessorManager::with_defaults();
        let names = vec!["compressor".to_string(), "compressor".to_string()];
        assert_eq!(manager.resolve(&names)?.len(), 1);

        let data = b"payload\n".repeat(100);
        assert_eq!(round_trip(data.clone(), &names).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_list_is_identity() -> anyhow::Result<()> {
        let manager = BackupProcessorManager::with_defaults();
        let mut out = Vec::new();
        let mut stream = manager.process(Box::pin(Cursor::new(b"plain".to_vec())), &[])?;
        stream.read_to_end(&mut out).await?;
        assert_eq!(out, b"plain");
        Ok(())
    }

    #[test]
    fn test_unknown_processor_is_rejected() {
        let manager = BackupProcessorManager::with_defaults();
        let result = manager.validate(&["encryptor".to_string()]);
        assert!(matches!(result, Err(AppError::UnknownProcessor(name)) if name == "encryptor"));
    }
}
