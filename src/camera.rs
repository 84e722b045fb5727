//! Camera control actor.
//!
//! All PTZ traffic goes through a single task that owns the transport, the
//! position registry and the preset map. Callers talk to it through a
//! cloneable [`CameraHandle`]; commands are serialized, so the physical
//! camera never receives interleaved move requests.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cycle::SharedCycleState;
use crate::positions::{HOME_POSITION, Position, PositionRegistry};
use crate::preset_map::PresetMap;
use crate::transport::PtzTransport;

#[derive(Debug)]
pub enum CameraCommand {
    MoveToPosition {
        position_id: u8,
        respond_to: oneshot::Sender<bool>,
    },
    Stop {
        respond_to: oneshot::Sender<bool>,
    },
    DiscoverPresets {
        respond_to: oneshot::Sender<BTreeMap<String, String>>,
    },
    GetPositions {
        respond_to: oneshot::Sender<Vec<Position>>,
    },
}

/// Cloneable front door to the camera actor.
///
/// Every method degrades to a "failed" answer when the actor is gone;
/// camera trouble must never take the rest of the daemon down with it.
#[derive(Clone)]
pub struct CameraHandle {
    tx: mpsc::UnboundedSender<CameraCommand>,
}

impl CameraHandle {
    /// Move the camera to a registered position. Returns `false` when the
    /// position is unknown, unmapped, or the transport rejected the move.
    pub async fn move_to(&self, position_id: u8) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CameraCommand::MoveToPosition {
                position_id,
                respond_to: tx,
            })
            .is_err()
        {
            error!("Camera task is gone, cannot move to position {position_id}");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Halt any in-progress movement.
    pub async fn stop(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(CameraCommand::Stop { respond_to: tx }).is_err() {
            error!("Camera task is gone, cannot stop movement");
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Re-query the device's preset collection and rebuild the mapping.
    pub async fn discover_presets(&self) -> BTreeMap<String, String> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CameraCommand::DiscoverPresets { respond_to: tx })
            .is_err()
        {
            error!("Camera task is gone, cannot discover presets");
            return BTreeMap::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Snapshot of the position registry, preset bindings included.
    pub async fn positions(&self) -> Vec<Position> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(CameraCommand::GetPositions { respond_to: tx })
            .is_err()
        {
            error!("Camera task is gone, cannot list positions");
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

pub struct CameraActor {
    rx: mpsc::UnboundedReceiver<CameraCommand>,
    transport: Box<dyn PtzTransport>,
    registry: PositionRegistry,
    preset_map: PresetMap,
    move_speed: f32,
    state: SharedCycleState,
}

impl CameraActor {
    /// Spawn the actor task and hand back its handle. The initial preset
    /// discovery happens inside the task so startup is not blocked by a
    /// slow or absent camera.
    pub fn spawn(
        transport: Box<dyn PtzTransport>,
        registry: PositionRegistry,
        move_speed: f32,
        state: SharedCycleState,
    ) -> CameraHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut actor = Self {
            rx,
            transport,
            registry,
            preset_map: PresetMap::default(),
            move_speed,
            state,
        };
        tokio::spawn(async move {
            actor.refresh_presets().await;
            actor.run().await;
        });
        CameraHandle { tx }
    }

    async fn run(&mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                CameraCommand::MoveToPosition {
                    position_id,
                    respond_to,
                } => {
                    let ok = self.handle_move(position_id).await;
                    let _ = respond_to.send(ok);
                }
                CameraCommand::Stop { respond_to } => {
                    let ok = self.handle_stop().await;
                    let _ = respond_to.send(ok);
                }
                CameraCommand::DiscoverPresets { respond_to } => {
                    let presets = self.refresh_presets().await;
                    let _ = respond_to.send(presets);
                }
                CameraCommand::GetPositions { respond_to } => {
                    let _ = respond_to.send(self.registry.snapshot());
                }
            }
        }
        debug!("Camera command channel closed, shutting down camera task");
    }

    /// Query the device and rebuild the position-to-preset mapping.
    /// Returns whatever the device reported, empty on failure.
    async fn refresh_presets(&mut self) -> BTreeMap<String, String> {
        match self.transport.list_presets().await {
            Ok(presets) => {
                info!(
                    "Discovered {} presets via {}",
                    presets.len(),
                    self.transport.describe()
                );
                self.preset_map = PresetMap::rebuild(&presets, &self.registry);
                for id in self.registry.patrol_ids() {
                    let token = self.preset_map.token_for(id).map(ToString::to_string);
                    self.registry.set_preset_ref(id, token);
                }
                let home_token = self
                    .preset_map
                    .token_for(HOME_POSITION)
                    .map(ToString::to_string);
                self.registry.set_preset_ref(HOME_POSITION, home_token);
                presets
            }
            Err(e) => {
                error!("Preset discovery failed: {e}");
                BTreeMap::new()
            }
        }
    }

    async fn handle_move(&mut self, position_id: u8) -> bool {
        if !self.registry.contains(position_id) {
            warn!("Refusing to move to unknown position {position_id}");
            return false;
        }

        // An unmapped position gets one re-discovery before giving up; the
        // device's collection may have changed since startup.
        let token = match self.resolve_token(position_id).await {
            Some(token) => token,
            None => {
                warn!("No preset is mapped to position {position_id}");
                return false;
            }
        };

        match self.transport.goto_preset(&token, self.move_speed).await {
            Ok(()) => {
                debug!("Moved to position {position_id} (preset {token})");
                let mut state = self.state.write().await;
                state.current_position = position_id;
                state.last_move_time = Some(Utc::now());
                true
            }
            Err(e) => {
                error!("Move to position {position_id} failed: {e}");
                false
            }
        }
    }

    async fn resolve_token(&mut self, position_id: u8) -> Option<String> {
        if let Some(token) = self.preset_map.token_for(position_id) {
            return Some(token.to_string());
        }
        self.refresh_presets().await;
        self.preset_map
            .token_for(position_id)
            .map(ToString::to_string)
    }

    async fn handle_stop(&mut self) -> bool {
        match self.transport.stop().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Stop command failed ({e}), re-issuing the current preset instead");
                // Fallback: snapping back to the current position also
                // cancels whatever motion is in progress.
                let current = { self.state.read().await.current_position };
                match self.preset_map.token_for(current) {
                    Some(token) => {
                        let token = token.to_string();
                        self.transport
                            .goto_preset(&token, self.move_speed)
                            .await
                            .is_ok()
                    }
                    None => false,
                }
            }
        }
    }
}

/// Convenience wiring used by both the daemon and the one-shot CLI paths.
pub fn spawn_camera(
    transport: Box<dyn PtzTransport>,
    registry: PositionRegistry,
    move_speed: f32,
    state: SharedCycleState,
) -> CameraHandle {
    CameraActor::spawn(transport, registry, move_speed, state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::cycle::CycleState;
    use crate::error::OurResult;
    use crate::error::OurError;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct FakeTransport {
        presets: BTreeMap<String, String>,
        gotos: Arc<Mutex<Vec<String>>>,
        stop_fails: bool,
    }

    impl FakeTransport {
        fn with_presets(presets: BTreeMap<String, String>) -> (Box<Self>, Arc<Mutex<Vec<String>>>) {
            let gotos = Arc::new(Mutex::new(Vec::new()));
            let transport = Box::new(Self {
                presets,
                gotos: gotos.clone(),
                stop_fails: false,
            });
            (transport, gotos)
        }
    }

    #[async_trait]
    impl PtzTransport for FakeTransport {
        fn describe(&self) -> &str {
            "fake"
        }

        async fn list_presets(&self) -> OurResult<BTreeMap<String, String>> {
            Ok(self.presets.clone())
        }

        async fn goto_preset(&self, token: &str, _speed: f32) -> OurResult<()> {
            self.gotos
                .lock()
                .expect("goto log lock")
                .push(token.to_string());
            Ok(())
        }

        async fn stop(&self) -> OurResult<()> {
            if self.stop_fails {
                return Err(OurError::Camera("stop unsupported".to_string()));
            }
            Ok(())
        }
    }

    fn preset(token: &str, name: &str) -> (String, String) {
        (token.to_string(), name.to_string())
    }

    fn compass_presets() -> BTreeMap<String, String> {
        BTreeMap::from([
            preset("11", "east"),
            preset("12", "west"),
            preset("13", "north"),
            preset("14", "south"),
        ])
    }

    #[tokio::test]
    async fn test_move_updates_state() {
        let (transport, gotos) = FakeTransport::with_presets(compass_presets());
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state.clone());

        assert!(handle.move_to(2).await);
        assert_eq!(*gotos.lock().expect("goto log lock"), vec!["12"]);
        let state = state.read().await;
        assert_eq!(state.current_position, 2);
        assert!(state.last_move_time.is_some());
    }

    #[tokio::test]
    async fn test_move_to_unknown_position_fails() {
        let (transport, _) = FakeTransport::with_presets(BTreeMap::new());
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state);

        assert!(!handle.move_to(99).await);
    }

    #[tokio::test]
    async fn test_stop_uses_transport() {
        let (transport, gotos) = FakeTransport::with_presets(compass_presets());
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state);

        assert!(handle.stop().await);
        // A clean stop never falls back to a preset re-issue.
        assert!(gotos.lock().expect("goto log lock").is_empty());
    }

    #[tokio::test]
    async fn test_stop_falls_back_to_current_preset() {
        let gotos = Arc::new(Mutex::new(Vec::new()));
        let transport = Box::new(FakeTransport {
            presets: compass_presets(),
            gotos: gotos.clone(),
            stop_fails: true,
        });
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state);

        assert!(handle.move_to(2).await);
        assert!(handle.stop().await);
        // The failed stop re-issues the preset the camera is already on.
        assert_eq!(*gotos.lock().expect("goto log lock"), vec!["12", "12"]);
    }

    #[tokio::test]
    async fn test_stop_fallback_fails_without_current_binding() {
        let gotos = Arc::new(Mutex::new(Vec::new()));
        // No presets at all: home has no binding for the fallback to use.
        let transport = Box::new(FakeTransport {
            presets: BTreeMap::new(),
            gotos,
            stop_fails: true,
        });
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state);

        assert!(!handle.stop().await);
    }

    #[tokio::test]
    async fn test_positions_carry_preset_bindings() {
        let (transport, _) = FakeTransport::with_presets(BTreeMap::from([preset("7", "изток")]));
        let state = CycleState::from_settings(&Settings::default()).shared();
        let handle = spawn_camera(transport, PositionRegistry::default(), 0.5, state);

        let positions = handle.positions().await;
        let east = positions
            .iter()
            .find(|p| p.id == 1)
            .expect("east position exists");
        assert_eq!(east.preset_ref.as_deref(), Some("7"));
    }
}
