//! Compiles stage declarations into linked chains.

use std::sync::Arc;

use crate::chain::{Chain, OutputChain, Part, StageRegistry};
use crate::contracts::Source;
use crate::errors::ConfigError;
use crate::manifest::StageDecl;
use crate::project::ProjectContext;
use crate::stage::{StageHandle, StageParams, StageSetup, StreamKind};

/// Turns a manifest entry's stage declarations into a runnable [`Chain`].
///
/// The walk follows nesting outward-in, building the outermost declaration
/// first and handing each built stage to the next as its upstream link, so
/// the innermost declaration ends up as the chain root. Positions count up
/// from the root. After linking, initializers run in declaration order.
pub struct ChainCompiler<'a> {
    registry: &'a StageRegistry,
    context: &'a Arc<ProjectContext>,
}

impl<'a> ChainCompiler<'a> {
    /// Creates a compiler over a registry and project context.
    #[must_use]
    pub fn new(registry: &'a StageRegistry, context: &'a Arc<ProjectContext>) -> Self {
        Self { registry, context }
    }

    /// Compiles an artifact or part chain.
    ///
    /// # Errors
    ///
    /// Returns the first wiring failure: empty or forked declarations,
    /// unknown stages, kind disagreements, bad parameters, or a failing
    /// initializer.
    pub fn compile(
        &self,
        kind: &'static str,
        entry: &str,
        decls: &[StageDecl],
        source: &Arc<dyn Source>,
    ) -> Result<Chain, ConfigError> {
        self.compile_inner(kind, entry, decls, source, false)
    }

    /// Compiles a part chain and checks it produces events.
    ///
    /// # Errors
    ///
    /// As [`compile`](Self::compile), plus [`ConfigError::PartNotEvents`].
    pub fn compile_part(
        &self,
        name: &str,
        decls: &[StageDecl],
        source: &Arc<dyn Source>,
    ) -> Result<Part, ConfigError> {
        let chain = self.compile_inner("part", name, decls, source, false)?;
        if chain.output_kind() != StreamKind::Events {
            return Err(ConfigError::PartNotEvents {
                name: name.to_string(),
            });
        }
        Ok(Part::new(name, chain))
    }

    /// Compiles an output tail: event transforms around one serializer.
    ///
    /// The outermost declaration is fed by the invoking chain, so it may
    /// lack an upstream; the tail's shape is validated after linking.
    ///
    /// # Errors
    ///
    /// As [`compile`](Self::compile), plus [`ConfigError::InvalidOutputTail`]
    /// for shapes that cannot run in pushed form.
    pub fn compile_output(
        &self,
        name: &str,
        decls: &[StageDecl],
        source: &Arc<dyn Source>,
    ) -> Result<OutputChain, ConfigError> {
        let chain = self.compile_inner("output", name, decls, source, true)?;
        match chain.root() {
            StageHandle::Bytes(_) => {}
            StageHandle::Events(root) => {
                return Err(ConfigError::InvalidOutputTail {
                    stage: root.name().to_string(),
                })
            }
        }
        for stage in &chain.stages()[1..] {
            if let StageHandle::Bytes(byte_stage) = stage {
                return Err(ConfigError::InvalidOutputTail {
                    stage: byte_stage.name().to_string(),
                });
            }
        }
        Ok(OutputChain::new(name, chain))
    }

    fn compile_inner(
        &self,
        kind: &'static str,
        entry: &str,
        decls: &[StageDecl],
        source: &Arc<dyn Source>,
        tail: bool,
    ) -> Result<Chain, ConfigError> {
        let flat = Self::flatten(kind, entry, decls)?;
        let count = flat.len();

        let mut upstream: Option<StageHandle> = None;
        let mut built: Vec<StageHandle> = Vec::with_capacity(count);
        for (index, decl) in flat.iter().enumerate() {
            let setup = StageSetup {
                entry: entry.to_string(),
                category: decl.category,
                type_name: decl.type_name.clone(),
                position: count - 1 - index,
                params: self.compile_params(entry, decl)?,
                source: Arc::clone(source),
                context: Arc::clone(self.context),
                upstream: upstream.clone(),
                tail: tail && index == 0,
            };
            let handle = self.registry.build_stage(setup)?;
            Self::check_link(entry, decl, &handle, upstream.as_ref(), tail && index == 0)?;
            upstream = Some(handle.clone());
            built.push(handle);
        }

        built.reverse();
        let chain = Chain::new(entry, built);
        chain.initialize()?;
        Ok(chain)
    }

    /// Flattens the nesting into declaration order, outermost first.
    fn flatten<'d>(
        kind: &'static str,
        entry: &str,
        decls: &'d [StageDecl],
    ) -> Result<Vec<&'d StageDecl>, ConfigError> {
        let mut current = match decls {
            [] => {
                return Err(ConfigError::EmptyChain {
                    kind,
                    name: entry.to_string(),
                })
            }
            [single] => single,
            _ => {
                return Err(ConfigError::MultipleChildren {
                    stage: entry.to_string(),
                })
            }
        };
        let mut flat = Vec::new();
        loop {
            flat.push(current);
            match current.stages.as_slice() {
                [] => break,
                [next] => current = next,
                _ => {
                    return Err(ConfigError::MultipleChildren {
                        stage: format!("{entry}/{}", current.label()),
                    })
                }
            }
        }
        Ok(flat)
    }

    fn check_link(
        entry: &str,
        decl: &StageDecl,
        handle: &StageHandle,
        upstream: Option<&StageHandle>,
        tail_head: bool,
    ) -> Result<(), ConfigError> {
        let display = || format!("{entry}/{}", decl.label());
        match (handle.input_kind(), upstream) {
            (None, None) => Ok(()),
            (None, Some(up)) => Err(ConfigError::UnexpectedUpstream {
                stage: display(),
                upstream: up.name().to_string(),
            }),
            (Some(expected), Some(up)) => {
                if up.output_kind() == expected {
                    Ok(())
                } else {
                    Err(ConfigError::KindMismatch {
                        stage: display(),
                        upstream: up.name().to_string(),
                        expected,
                        found: up.output_kind(),
                    })
                }
            }
            (Some(StreamKind::Events), None) if tail_head => Ok(()),
            (Some(expected), None) => Err(ConfigError::MissingUpstream {
                stage: display(),
                expected,
            }),
        }
    }

    fn compile_params(&self, entry: &str, decl: &StageDecl) -> Result<StageParams, ConfigError> {
        let mut params = StageParams::new();
        for param in &decl.params {
            let display = format!("{entry}/{}", decl.label());
            let value = self.interpolate(&display, &param.name, &param.value)?;
            params.insert(param.name.clone(), value);
        }
        Ok(params)
    }

    /// Substitutes `${name}` property references, one level deep: values
    /// pulled from properties are not re-scanned.
    fn interpolate(
        &self,
        stage: &str,
        param: &str,
        raw: &str,
    ) -> Result<String, ConfigError> {
        if !raw.contains("${") {
            return Ok(raw.to_string());
        }
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(ConfigError::InitFailed {
                    stage: stage.to_string(),
                    message: format!("unterminated property reference in parameter '{param}'"),
                });
            };
            let name = &after[..end];
            match self.context.property(name) {
                Some(value) => out.push_str(&value),
                None => {
                    return Err(ConfigError::UnknownProperty {
                        stage: stage.to_string(),
                        param: param.to_string(),
                        property: name.to_string(),
                    })
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
