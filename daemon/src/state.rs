use crate::generator::ImageGenerator;

/// Read-only state shared by every request once startup has finished
pub struct AppState {
    pub generator: ImageGenerator,
}

impl AppState {
    pub fn new(generator: ImageGenerator) -> Self {
        Self { generator }
    }
}
