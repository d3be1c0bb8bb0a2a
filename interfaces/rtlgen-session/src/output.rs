//! Turning raw model output into Verilog source files.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Markers the model may emit around or after the code.
const NOISE: [&str; 4] = ["<|endoftext|>", "<|im_end|>", "```verilog", "```"];

/// Strip special tokens and markdown fences from generated text.
pub fn clean_output(raw: &str) -> String {
    let mut cleaned = raw.to_string();
    for noise in NOISE {
        cleaned = cleaned.replace(noise, "");
    }
    cleaned.trim().to_string()
}

/// Keywords that can never name a module.
const KEYWORDS: [&str; 16] = [
    "module",
    "macromodule",
    "endmodule",
    "input",
    "output",
    "inout",
    "wire",
    "reg",
    "logic",
    "parameter",
    "localparam",
    "assign",
    "always",
    "begin",
    "end",
    "function",
];

/// The name of the first `module` declared in `source`, if any.
///
/// Comments and string literals are skipped, so prose like `// a 4-bit adder module` is not
/// mistaken for a declaration.
pub fn module_name(source: &str) -> Option<&str> {
    let mut tokens = Tokens { source, position: 0 };
    while let Some(token) = tokens.next() {
        if !matches!(token, Some("module" | "macromodule")) {
            continue;
        }
        if let Some(Some(name)) = tokens.next() {
            let starts_identifier = name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
            if starts_identifier && !KEYWORDS.contains(&name) {
                return Some(name);
            }
        }
    }
    None
}

fn is_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// The words of Verilog source outside comments and strings. Any other token is `None`.
struct Tokens<'a> {
    source: &'a str,
    position: usize,
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Option<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        let source = self.source;
        loop {
            let rest = &source[self.position..];
            let c = rest.chars().next()?;
            if c.is_whitespace() {
                self.position += c.len_utf8();
            } else if rest.starts_with("//") {
                self.position += rest.find('\n').unwrap_or(rest.len());
            } else if rest.starts_with("/*") {
                self.position += rest[2..].find("*/").map_or(rest.len(), |end| end + 4);
            } else if c == '"' {
                let mut escaped = false;
                let end = rest
                    .char_indices()
                    .skip(1)
                    .find(|&(_, c)| {
                        let closes = !escaped && c == '"';
                        escaped = !escaped && c == '\\';
                        closes
                    })
                    .map_or(rest.len(), |(index, _)| index + 1);
                self.position += end;
                return Some(None);
            } else if is_identifier_char(c) {
                let end = rest
                    .find(|c: char| !is_identifier_char(c))
                    .unwrap_or(rest.len());
                self.position += end;
                return Some(Some(&rest[..end]));
            } else {
                self.position += c.len_utf8();
                return Some(None);
            }
        }
    }
}

/// Writes each finished generation into a directory as a `.v` file.
#[derive(Debug, Clone)]
pub struct OutputDirectory {
    path: PathBuf,
    written: usize,
}

impl OutputDirectory {
    /// Create the directory if needed.
    pub fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, written: 0 })
    }

    /// The directory files are written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clean `raw` and write it to `<module>.v`, or `generation-<n>.v` if no module is declared.
    ///
    /// Existing files are never overwritten: a name that is taken gets a `-2`, `-3`, ... suffix.
    pub fn save(&mut self, raw: &str) -> std::io::Result<PathBuf> {
        let source = clean_output(raw);
        self.written += 1;
        let stem = match module_name(&source) {
            Some(name) => name.to_string(),
            None => format!("generation-{}", self.written),
        };
        let (path, mut file) = self.create_new(&stem)?;
        file.write_all(format!("{source}\n").as_bytes())?;
        tracing::info!("Saved generated Verilog to {}", path.display());
        Ok(path)
    }

    fn create_new(&self, stem: &str) -> std::io::Result<(PathBuf, File)> {
        let mut attempt = 1;
        loop {
            let file_name = match attempt {
                1 => format!("{stem}.v"),
                n => format!("{stem}-{n}.v"),
            };
            let path = self.path.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!("{} already exists", path.display());
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
