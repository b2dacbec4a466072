use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use dgscore::data::events::EventSet;
use dgscore::error::{Result, SliceError};

/// Boltzmann constant in meV/K.
pub const BOLTZMANN_MEV_PER_K: f64 = 0.086_173_332_62;

/// Inputs shared by the registered event-set corrections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionParams {
    /// Sample temperature in K; overrides the temperature log when set.
    pub temperature: Option<f64>,
    pub temperature_log: String,
    pub incident_energy_log: String,
    /// Exponent factor (1/meV) of the analyzer transmission `exp(-c·Ef)`.
    pub transmission_exponent: f64,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        CorrectionParams {
            temperature: None,
            temperature_log: "temperature".to_string(),
            incident_energy_log: "Ei".to_string(),
            transmission_exponent: 1.0 / 11.0,
        }
    }
}

pub type CorrectionFn = fn(&EventSet, &CorrectionParams) -> Result<EventSet>;

/// Closed set of named corrections that can be applied to an event set
/// before binning.
#[derive(Clone)]
pub struct CorrectionRegistry {
    corrections: BTreeMap<String, CorrectionFn>,
}

impl Default for CorrectionRegistry {
    fn default() -> Self {
        let mut registry = CorrectionRegistry::empty();
        registry.register("detailed_balance", detailed_balance);
        registry.register("scattered_transmission", scattered_transmission);
        registry
    }
}

impl CorrectionRegistry {
    pub fn empty() -> Self {
        CorrectionRegistry { corrections: BTreeMap::new() }
    }

    pub fn register(&mut self, name: &str, correction: CorrectionFn) {
        self.corrections.insert(name.to_string(), correction);
    }

    pub fn names(&self) -> Vec<&str> {
        self.corrections.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<CorrectionFn> {
        self.corrections.get(name).copied().ok_or_else(|| {
            SliceError::config(format!(
                "unknown correction '{}'; registered corrections are: {}",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Applies the named corrections in order.
    pub fn apply_all(&self, names: &[String], events: &EventSet, params: &CorrectionParams) -> Result<Option<EventSet>> {
        if names.is_empty() {
            return Ok(None);
        }
        // resolve everything first so a typo fails before any work is done
        let corrections: Vec<CorrectionFn> = names.iter().map(|n| self.get(n)).collect::<Result<_>>()?;
        let mut current = events.clone();
        for (name, correction) in names.iter().zip(corrections) {
            debug!(correction = %name, events = %current.name, "applying correction");
            current = correction(&current, params)?;
        }
        Ok(Some(current))
    }
}

fn energy_axis(events: &EventSet, correction: &str) -> Result<usize> {
    events.energy_index().ok_or_else(|| {
        SliceError::config(format!("{} needs an energy transfer dimension, '{}' has none", correction, events.name))
    })
}

/// Converts scattering intensity to the imaginary part of the dynamic
/// susceptibility: multiplies by `π·(1 - exp(-ΔE / kB·T))`.
pub fn detailed_balance(events: &EventSet, params: &CorrectionParams) -> Result<EventSet> {
    let energy = energy_axis(events, "detailed balance")?;

    let mut factors = Vec::with_capacity(events.n_events());
    for i in 0..events.n_events() {
        let temperature = params
            .temperature
            .or_else(|| events.run_info(i).log(&params.temperature_log))
            .ok_or_else(|| {
                SliceError::config(format!(
                    "temperature is required for detailed balance of '{}' (set it or record the '{}' log)",
                    events.name, params.temperature_log
                ))
            })?;
        if !(temperature > 0.0) {
            return Err(SliceError::config(format!(
                "detailed balance of '{}' needs a positive temperature, got {}",
                events.name, temperature
            )));
        }
        let delta_e = events.event_coords(i)[energy];
        factors.push(std::f64::consts::PI * (1.0 - (-delta_e / (BOLTZMANN_MEV_PER_K * temperature)).exp()));
    }
    Ok(events.scaled_by(&events.name, &factors))
}

/// Divides out the analyzer transmission `exp(-c·Ef)` with `Ef = Ei - ΔE`.
pub fn scattered_transmission(events: &EventSet, params: &CorrectionParams) -> Result<EventSet> {
    let energy = energy_axis(events, "scattered transmission")?;

    let mut factors = Vec::with_capacity(events.n_events());
    for i in 0..events.n_events() {
        let ei = events.run_info(i).log(&params.incident_energy_log).ok_or_else(|| {
            SliceError::config(format!(
                "scattered transmission of '{}' needs the incident energy log '{}'",
                events.name, params.incident_energy_log
            ))
        })?;
        let ef = ei - events.event_coords(i)[energy];
        factors.push((params.transmission_exponent * ef).exp());
    }
    Ok(events.scaled_by(&events.name, &factors))
}
