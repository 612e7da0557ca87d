use std::fmt::Formatter;

use thiserror::Error;

/// An error that is localised to a particular instruction in the program
/// under analysis.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Located<E>
where
    E: Clone,
{
    /// The unique identifier of the instruction at which the error occurred.
    pub instruction_id: u64,

    /// The source file and line of that instruction, where debug information
    /// was available.
    pub source: Option<(String, u32)>,

    /// The error data.
    pub payload: E,
}

/// Displays the error together with the source position at which it
/// occurred, falling back to the instruction identifier where no debug
/// information was attached.
impl<E> std::fmt::Display for Located<E>
where
    E: std::fmt::Display + Clone,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.source {
            Some((file, line)) => write!(f, "[{file}:{line}]: {}", self.payload),
            None => write!(
                f,
                "[inst 0x{}]: {}",
                hex::encode(self.instruction_id.to_be_bytes()),
                self.payload
            ),
        }
    }
}

impl<E> std::error::Error for Located<E> where E: std::fmt::Debug + std::fmt::Display + Clone {}

/// A trait for types that can have an instruction location attached to them.
pub trait Locatable
where
    Self: Sized,
{
    /// The return type with the attached location.
    type Located;

    /// Attaches the location described by `instruction_id` and the optional
    /// `source` file/line pair to the error.
    fn locate(self, instruction_id: u64, source: Option<(String, u32)>) -> Self::Located;
}

/// A blanket implementation that allows for attaching a location to any
/// result.
impl<T, E> Locatable for Result<T, E>
where
    E: std::error::Error + Clone,
{
    type Located = Result<T, Located<E>>;

    fn locate(self, instruction_id: u64, source: Option<(String, u32)>) -> Self::Located {
        self.map_err(|e| Located {
            instruction_id,
            source,
            payload: e,
        })
    }
}

/// An error that is a collection of errors.
///
/// The order of the errors in the container defaults to the order in which
/// the errors were added to the container.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub struct Errors<E> {
    payloads: Vec<E>,
}

impl<E> Errors<E> {
    /// Creates a new container for errors.
    #[must_use]
    pub fn new() -> Self {
        let payloads = vec![];
        Self { payloads }
    }

    /// Gets the errors contained within this error.
    #[must_use]
    pub fn payloads(&self) -> &[E] {
        self.payloads.as_slice()
    }

    /// Gets the length of the errors container.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Checks if the errors container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Errors<E>
where
    E: std::error::Error,
{
    /// Adds the provided `error` to the container.
    pub fn add(&mut self, error: E) {
        self.payloads.push(error);
    }

    /// Adds the multiple provided errors to the container.
    pub fn add_many(&mut self, errors: impl Into<Vec<E>>) {
        self.payloads.extend(errors.into());
    }
}

/// The default errors container is one containing no errors.
impl<E> Default for Errors<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Allow conversion from any error type to a container of errors.
impl<E> From<E> for Errors<E>
where
    E: std::error::Error,
{
    fn from(value: E) -> Self {
        let mut errors = Self::default();
        errors.add(value);
        errors
    }
}

/// Allow conversion from the errors container to a vector of errors.
impl<E> From<Errors<E>> for Vec<E>
where
    E: std::error::Error,
{
    fn from(value: Errors<E>) -> Self {
        value.payloads
    }
}

/// Displays the errors in the sequence in which they occur in the container.
///
/// It has a header specifying how many errors occurred, and then prints one
/// error per line after that.
impl<E> std::fmt::Display for Errors<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.payloads.is_empty() {
            write!(f, "Encountered no errors")?;
        } else {
            writeln!(f, "Encountered {} errors:", self.payloads.len())?;
            for error in &self.payloads {
                writeln!(f, "{error}")?;
            }
        }

        Ok(())
    }
}
