use std::sync::Arc;

use crate::{
    error::Result,
    types::{PcmFormat, Track},
};

/// A decoder instance bound to one track. Dropping it frees the decoder.
pub trait Decoder: Send {
    /// Prepares the decoder for `track` and reports its native format.
    fn init(&mut self, track: &Track) -> Result<PcmFormat>;

    /// Fills `buf` with interleaved PCM in the native format.
    ///
    /// Returns the number of bytes written. Anything short of `buf.len()`
    /// means the stream has ended.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// A decoder implementation, looked up by its stable id.
pub trait DecoderPlugin: Send + Sync {
    fn id(&self) -> &str;

    /// File extensions (lowercase, no dot) this decoder claims when probing.
    fn extensions(&self) -> &[&str] {
        &[]
    }

    fn open(&self) -> Box<dyn Decoder>;
}

#[derive(Clone, Default)]
pub struct DecoderRegistry {
    plugins: Vec<Arc<dyn DecoderPlugin>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled WAV and symphonia decoders.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(crate::audio::WavDecoderPlugin));
        reg.register(Arc::new(crate::audio::SymphoniaDecoderPlugin));
        reg
    }

    /// Later registrations with an existing id replace the earlier plugin.
    pub fn register(&mut self, plugin: Arc<dyn DecoderPlugin>) {
        self.plugins.retain(|p| p.id() != plugin.id());
        self.plugins.push(plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DecoderPlugin>> {
        self.plugins.iter().find(|p| p.id() == id).cloned()
    }

    /// First decoder claiming `ext`, else the last registered one.
    pub fn for_extension(&self, ext: &str) -> Option<Arc<dyn DecoderPlugin>> {
        let ext = ext.to_ascii_lowercase();
        self.plugins
            .iter()
            .find(|p| p.extensions().iter().any(|e| *e == ext))
            .or_else(|| self.plugins.last())
            .cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.id()).collect()
    }
}
