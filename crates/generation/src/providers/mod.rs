pub mod comfy;
pub mod openai;

pub use comfy::ComfyProvider;
pub use openai::{OPENAI_PROVIDER_ID, OpenAiImageProvider};
