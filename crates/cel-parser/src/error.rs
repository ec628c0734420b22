use std::fmt;

/// One syntax error anchored to a byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub offset: u32,
}

/// All errors from one parse, with enough source context to render
/// line/column positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErrors {
    pub errors: Vec<ParseError>,
    source: String,
}

impl ParseErrors {
    pub(crate) fn single(error: ParseError, source: &str) -> Self {
        Self {
            errors: vec![error],
            source: source.to_string(),
        }
    }

    pub(crate) fn many(errors: Vec<ParseError>, source: &str) -> Self {
        Self {
            errors,
            source: source.to_string(),
        }
    }

    /// 1-based line and column for a byte offset.
    fn line_col(&self, offset: u32) -> (usize, usize) {
        let offset = (offset as usize).min(self.source.len());
        let mut line = 1;
        let mut col = 1;
        for (i, c) in self.source.char_indices() {
            if i >= offset {
                break;
            }
            if c == '\n' {
                line += 1;
                col = 1;
            } else {
                col += 1;
            }
        }
        (line, col)
    }
}

impl fmt::Display for ParseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            let (line, col) = self.line_col(err.offset);
            write!(f, "syntax error at {line}:{col}: {}", err.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseErrors {}
