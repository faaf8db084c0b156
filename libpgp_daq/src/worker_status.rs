use super::configurator::Stage;

#[derive(Debug, Clone, Default)]
pub enum BarColor {
    #[default]
    CYAN,
    MAGENTA,
    RED,
    GREEN,
}

/// Progress report sent from a lane worker to whoever is watching
#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub progress: f32,
    pub lane: u8,
    pub worker_id: usize,
    pub color: BarColor,
    /// The configure stage being worked on, if the worker is configuring
    pub stage: Option<Stage>,
}

impl WorkerStatus {
    pub fn new(progress: f32, lane: u8, worker_id: usize, color: BarColor) -> Self {
        Self {
            progress,
            lane,
            worker_id,
            color,
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }
}
