/// Raw point records as read from input files.
use std::fmt;

/// A single point in the projected input coordinate system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Planar projection used for footprint containment.
    pub fn planar(&self) -> geo::Point<f64> {
        geo::Point::new(self.x, self.y)
    }

    /// Parse one text record.
    ///
    /// Returns `Ok(None)` for blank and comment lines. Fields may be separated
    /// by whitespace, commas or semicolons; columns past the third are ignored.
    pub fn parse_record(line: &str) -> Result<Option<Self>, String> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
            return Ok(None);
        }

        let mut fields = trimmed
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|field| !field.is_empty());

        let mut coords = [0.0f64; 3];
        for (axis, slot) in coords.iter_mut().enumerate() {
            let field = fields
                .next()
                .ok_or_else(|| format!("expected 3 coordinates, found {}", axis))?;
            *slot = field
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", field))?;
            if !slot.is_finite() {
                return Err(format!("'{}' is not a finite coordinate", field));
            }
        }

        Ok(Some(Self::new(coords[0], coords[1], coords[2])))
    }
}

/// Formats the point as an output record: `x y z`.
impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.x, self.y, self.z)
    }
}
