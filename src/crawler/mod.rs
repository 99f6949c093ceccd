pub mod arxiv;
pub mod input;

pub use arxiv::ArxivCrawler;
pub use input::PaperInput;
