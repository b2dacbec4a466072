use std::fmt;
use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};
use nalgebra::{Matrix3, Vector3};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SliceError};

/// Crystallographic point operation in Jones-faithful notation, e.g. `-x,-y,-z`
/// or `-y,x-y,z`. Translations are accepted and dropped, they have no effect
/// on reciprocal-space coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SymmetryOperation {
    pub identifier: String,
    pub matrix: [[f64; 3]; 3],
}

impl SymmetryOperation {
    pub fn identity() -> Self {
        SymmetryOperation {
            identifier: "x,y,z".to_string(),
            matrix: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// Parses a single operation made of exactly three components.
    pub fn parse(text: &str) -> Result<Self> {
        let components: Vec<&str> = text.split(',').collect();
        if components.len() != 3 {
            return Err(SliceError::config(format!(
                "symmetry operation '{}' must have three components",
                text.trim()
            )));
        }
        Self::from_components(&components)
    }

    /// Parses a list of operations separated by `;`, or given as consecutive
    /// comma-separated triples (`"x,y,z,-x,-y,-z"`).
    pub fn parse_list(text: &str) -> Result<Vec<Self>> {
        let mut ops = Vec::new();
        for group in text.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let components: Vec<&str> = group.split(',').collect();
            if components.len() % 3 != 0 {
                return Err(SliceError::config(format!(
                    "symmetry operation list '{}' does not split into x,y,z triples",
                    group
                )));
            }
            for triple in components.chunks(3) {
                ops.push(Self::from_components(triple)?);
            }
        }
        Ok(ops)
    }

    fn from_components(components: &[&str]) -> Result<Self> {
        let mut matrix = [[0.0; 3]; 3];
        let mut cleaned = Vec::with_capacity(3);
        for (row, component) in components.iter().enumerate() {
            let compact: String = component.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_lowercase();
            matrix[row] = parse_component(&compact)?;
            cleaned.push(compact);
        }
        let op = SymmetryOperation { identifier: cleaned.join(","), matrix };

        let det = op.matrix().determinant();
        if (det.abs() - 1.0).abs() > 1e-9 {
            return Err(SliceError::config(format!(
                "symmetry operation '{}' is not a valid group element (determinant {})",
                op.identifier, det
            )));
        }
        Ok(op)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        let m = &self.matrix;
        Matrix3::new(
            m[0][0], m[0][1], m[0][2],
            m[1][0], m[1][1], m[1][2],
            m[2][0], m[2][1], m[2][2],
        )
    }

    pub fn apply(&self, hkl: &Vector3<f64>) -> Vector3<f64> {
        self.matrix() * hkl
    }
}

impl Display for SymmetryOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identifier)
    }
}

fn parse_number(text: &str) -> Option<f64> {
    match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 { None } else { Some(num / den) }
        }
        None => text.parse().ok(),
    }
}

/// One row of the rotation part: coefficients of x, y and z.
fn parse_component(component: &str) -> Result<[f64; 3]> {
    let invalid = || SliceError::config(format!("invalid symmetry operation component '{}'", component));
    if component.is_empty() {
        return Err(invalid());
    }

    let term = Regex::new(r"[+-]?[^+-]+").unwrap();
    let mut row = [0.0; 3];
    let mut consumed = 0;
    let mut has_axis = false;

    for m in term.find_iter(component) {
        if m.start() != consumed {
            return Err(invalid());
        }
        consumed = m.end();

        let token = m.as_str();
        let (sign, body) = match token.as_bytes()[0] {
            b'-' => (-1.0, &token[1..]),
            b'+' => (1.0, &token[1..]),
            _ => (1.0, token),
        };
        let axis = match body.chars().last() {
            Some('x') => Some(0),
            Some('y') => Some(1),
            Some('z') => Some(2),
            _ => None,
        };

        match axis {
            Some(axis) => {
                let coefficient = body[..body.len() - 1].trim_end_matches('*');
                let value = if coefficient.is_empty() {
                    1.0
                } else {
                    parse_number(coefficient).ok_or_else(invalid)?
                };
                row[axis] += sign * value;
                has_axis = true;
            }
            // translation part, irrelevant for reciprocal-space folding
            None => {
                parse_number(body).ok_or_else(invalid)?;
            }
        }
    }

    if consumed != component.len() || !has_axis {
        return Err(invalid());
    }
    Ok(row)
}
