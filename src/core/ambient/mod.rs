pub mod clips;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use thiserror::Error;

use super::media::{AudioEngine, DecodedClip, SourceId, TransportError};
use super::rooms::AmbientSourceSpec;
use super::spatial::{clamp, AudioPosition, RoomBounds};

pub use clips::{ClipError, ClipLoader};

#[derive(Debug, Error)]
pub enum AmbientError {
    #[error("failed to read clip {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: ClipError,
    },
    #[error("no clip in the group could be loaded")]
    NoPlayableClips,
    #[error(transparent)]
    Engine(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedSource {
    pub id: SourceId,
    pub display_name: String,
    pub position: AudioPosition,
}

#[derive(Debug, Clone)]
struct RegisteredSource {
    group: u64,
    display_name: String,
}

type SourceRegistry = Arc<Mutex<HashMap<SourceId, RegisteredSource>>>;

fn lock_registry(
    registry: &Mutex<HashMap<SourceId, RegisteredSource>>,
) -> MutexGuard<'_, HashMap<SourceId, RegisteredSource>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Loops groups of local ambient sources. Every member of a group starts in
/// the same engine call; the group restarts once all members have ended and
/// only while all of them are still registered.
pub struct AmbientScheduler {
    engine: Arc<dyn AudioEngine>,
    loader: ClipLoader,
    registry: SourceRegistry,
    next_group: AtomicU64,
}

impl AmbientScheduler {
    pub fn new(engine: Arc<dyn AudioEngine>, loader: ClipLoader) -> Self {
        Self {
            engine,
            loader,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_group: AtomicU64::new(1),
        }
    }

    /// Loads every clip of the group in parallel, then starts the ones that
    /// decoded. Clips that fail are logged and left out.
    pub async fn start_group(
        &self,
        specs: &[AmbientSourceSpec],
        bounds: RoomBounds,
    ) -> Result<Vec<StartedSource>, AmbientError> {
        let loads = join_all(specs.iter().map(|spec| self.loader.load(&spec.url))).await;

        let mut playable = Vec::with_capacity(specs.len());
        for (spec, loaded) in specs.iter().zip(loads) {
            match loaded {
                Ok(clip) => playable.push((spec.clone(), Arc::new(clip))),
                Err(err) => log::warn!("skipping ambient source {}: {err}", spec.url),
            }
        }

        self.start_decoded(playable, bounds)
    }

    pub fn start_decoded(
        &self,
        clips: Vec<(AmbientSourceSpec, Arc<DecodedClip>)>,
        bounds: RoomBounds,
    ) -> Result<Vec<StartedSource>, AmbientError> {
        if clips.is_empty() {
            return Err(AmbientError::NoPlayableClips);
        }

        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        let mut started: Vec<StartedSource> = Vec::with_capacity(clips.len());

        for (spec, clip) in clips {
            let id = match self.engine.add_local_source(clip) {
                Ok(id) => id,
                Err(err) => {
                    for source in &started {
                        self.engine.stop_source(&source.id);
                        lock_registry(&self.registry).remove(&source.id);
                    }
                    return Err(err.into());
                }
            };

            let position = clamp(AudioPosition::new(spec.x, spec.y, 0.0), bounds);
            self.engine.set_source_position(&id, position.x, position.y);
            lock_registry(&self.registry).insert(
                id.clone(),
                RegisteredSource {
                    group,
                    display_name: spec.display_name.clone(),
                },
            );
            log::info!("starting local source id={id} url={}", spec.url);
            started.push(StartedSource {
                id,
                display_name: spec.display_name,
                position,
            });
        }

        let ids = started.iter().map(|source| source.id.clone()).collect();
        tokio::spawn(run_group(
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            group,
            ids,
        ));
        Ok(started)
    }

    /// Unregisters and stops every local source. Running groups see the
    /// missing registrations and do not restart.
    pub fn stop_all(&self) -> Vec<SourceId> {
        let stopped = lock_registry(&self.registry)
            .drain()
            .map(|(id, _)| id)
            .collect::<Vec<_>>();
        for id in &stopped {
            log::info!("stopping local source id={id}");
            self.engine.stop_source(id);
        }
        stopped
    }

    /// Drops one source from the registry without stopping it; its group
    /// finishes the current cycle and then ends.
    pub fn unregister(&self, id: &str) -> bool {
        lock_registry(&self.registry).remove(id).is_some()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        lock_registry(&self.registry).contains_key(id)
    }

    pub fn display_name(&self, id: &str) -> Option<String> {
        lock_registry(&self.registry)
            .get(id)
            .map(|source| source.display_name.clone())
    }

    pub fn registered(&self) -> Vec<SourceId> {
        let mut ids = lock_registry(&self.registry)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn group_of(&self, id: &str) -> Option<u64> {
        lock_registry(&self.registry).get(id).map(|source| source.group)
    }
}

async fn run_group(
    engine: Arc<dyn AudioEngine>,
    registry: SourceRegistry,
    group: u64,
    ids: Vec<SourceId>,
) {
    loop {
        let ended = engine.start_sources(&ids);
        if ended.is_empty() {
            break;
        }

        // Stopped sources drop their sender, which also counts as ended.
        join_all(ended).await;

        let alive = {
            let registry = lock_registry(&registry);
            ids.iter().all(|id| registry.contains_key(id))
        };
        if !alive {
            log::debug!("ambient group {group} lost a member; not restarting");
            break;
        }
        log::debug!("restarting ambient group {group}");
    }
}
