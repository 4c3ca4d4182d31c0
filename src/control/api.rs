use crate::{Engine, EngineError, EngineStatus, StreamHandle, TriggerCommand};

/// Fetch the current engine status snapshot.
pub fn get_status(engine: &Engine) -> EngineStatus {
    engine.status()
}

/// Start or stop the specified stream.
pub fn set_running(engine: &Engine, stream: StreamHandle, running: bool) -> Result<(), EngineError> {
    let command = if running {
        TriggerCommand::Start
    } else {
        TriggerCommand::Stop
    };
    engine.trigger(stream, command)
}

/// Flip the PCM dump toggle, returning the new state.
pub fn toggle_dump(engine: &Engine) -> bool {
    let enabled = !engine.status().dump_enabled;
    engine.set_pcm_dump_enabled(enabled);
    enabled
}
