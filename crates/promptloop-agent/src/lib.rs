mod claude;
mod opencode;
mod output;
mod retry;
mod spawner;
mod traits;

pub use claude::ClaudeCodeGenerator;
pub use opencode::OpenCodeGenerator;
pub use output::GeneratorOutput;
pub use retry::{RetryPolicy, RetryingGenerator};
pub use spawner::ProcessSpawner;
pub use traits::{GenerationConfig, Generator, GeneratorError, GeneratorType};

/// Create a generator by type
pub fn create_generator(generator_type: GeneratorType) -> Box<dyn Generator> {
    match generator_type {
        GeneratorType::ClaudeCode => Box::new(ClaudeCodeGenerator::new()),
        GeneratorType::OpenCode => Box::new(OpenCodeGenerator::new()),
    }
}
