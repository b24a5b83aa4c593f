pub mod line;
pub mod parser;

pub use line::{Line, LineOrigin};
pub use parser::{Command, SyntaxClass, is_classic_name, parse_line};
