//! Codeframes: loaded bytecode units paired with their materialized constants.
//!
//! A codeframe is created the first time its path is loaded and cached by that
//! path, so every frame is materialized at most once. Nested code constants are
//! loaded as child codeframes under `"{path}#{index}"`.

use std::sync::Arc;

use ahash::AHashMap;
use regex::Regex;

use crate::{
    bytecode::{Bytecode, Constant, LoadError},
    heap::{Heap, HeapId},
    object::{Callable, Object, ObjectKind},
    resource::{ResourceError, ResourceTracker},
};

/// Index of a codeframe in the [`CodeframeCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CodeframeId(usize);

#[derive(Debug)]
pub(crate) struct Codeframe {
    pub path: String,
    pub bytecode: Arc<Bytecode>,
    /// One object per constant table entry; each holds one reference.
    pub constants: Vec<HeapId>,
}

/// Errors raised while materializing a codeframe.
#[derive(Debug, thiserror::Error)]
pub(crate) enum MaterializeError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

#[derive(Debug, Default)]
pub(crate) struct CodeframeCache {
    frames: Vec<Codeframe>,
    by_path: AHashMap<String, CodeframeId>,
}

impl CodeframeCache {
    /// Returns the codeframe for `path`, materializing it on first use.
    pub fn load<T: ResourceTracker>(
        &mut self,
        path: &str,
        bytecode: &Arc<Bytecode>,
        heap: &mut Heap<T>,
    ) -> Result<CodeframeId, MaterializeError> {
        if let Some(&id) = self.by_path.get(path) {
            tracing::trace!(path, "codeframe cache hit");
            return Ok(id);
        }
        tracing::trace!(path, constants = bytecode.constants().len(), "codeframe cache miss");

        let mut constants = Vec::with_capacity(bytecode.constants().len());
        for (index, constant) in bytecode.constants().iter().enumerate() {
            match self.materialize(path, index, constant, heap) {
                Ok(id) => constants.push(id),
                Err(err) => {
                    for id in constants {
                        heap.dec_ref(id);
                    }
                    return Err(err);
                }
            }
        }

        let id = CodeframeId(self.frames.len());
        self.frames.push(Codeframe {
            path: path.to_owned(),
            bytecode: Arc::clone(bytecode),
            constants,
        });
        self.by_path.insert(path.to_owned(), id);
        Ok(id)
    }

    fn materialize<T: ResourceTracker>(
        &mut self,
        path: &str,
        index: usize,
        constant: &Constant,
        heap: &mut Heap<T>,
    ) -> Result<HeapId, MaterializeError> {
        let object = match constant {
            Constant::String(s) => Object::new("string", ObjectKind::String(s.clone())),
            Constant::Number(n) => Object::new("numerical", ObjectKind::Numerical(*n)),
            Constant::Regex(pattern) => {
                let regex = Regex::new(pattern).map_err(|err| LoadError::Regex {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })?;
                Object::new("regex", ObjectKind::Regex(regex))
            }
            Constant::Code(child) => {
                let child_path = format!("{path}#{index}");
                let child_id = self.load(&child_path, child, heap)?;
                Object::new(child_path, ObjectKind::Callable(Callable::Code(child_id)))
            }
        };
        Ok(heap.allocate(object)?)
    }

    /// # Panics
    /// Panics if `id` did not come from this cache.
    #[must_use]
    pub fn get(&self, id: CodeframeId) -> &Codeframe {
        self.frames.get(id.0).expect("CodeframeCache::get: unknown codeframe")
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Drops every codeframe and the constant objects it holds.
    pub fn release_all<T: ResourceTracker>(&mut self, heap: &mut Heap<T>) {
        for frame in self.frames.drain(..) {
            for id in frame.constants {
                heap.dec_ref(id);
            }
        }
        self.by_path.clear();
    }
}
