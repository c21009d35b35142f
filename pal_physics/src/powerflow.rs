//! Linear DC power-flow solver.
//!
//! Given bus injections (generator telemetry minus configured loads) and a
//! static line susceptance map, solves `θ = B⁻¹·P` with bus 0 as slack and
//! derives per-line MW flows. A line whose flow magnitude exceeds its
//! rating raises its overload coil. The reduced `B` matrix is factored
//! once at construction — topology is static for the life of the run.

use tracing::warn;

use crate::{PhysicsModel, PhysicsResult, encode_x10};
use pal_common::config::PowerFlowParams;
use pal_common::memory::{AddressKey, Value};
use pal_fabric::Fabric;

/// Address layout on the owning device.
pub mod addr {
    use pal_common::memory::AddressKey;

    /// Per-bus load override [MW × 10], index = bus id (externally writable).
    pub const fn bus_load(bus: u16) -> AddressKey {
        AddressKey::holding(bus)
    }

    /// Per-line overload flag, index = line id.
    pub const fn line_overload(line: u16) -> AddressKey {
        AddressKey::coil(20 + line)
    }

    /// Per-line absolute flow [MW × 10], index = line id.
    pub const fn line_flow(line: u16) -> AddressKey {
        AddressKey::input(10 + line)
    }
}

/// System base for per-unit conversion [MVA].
const BASE_MVA: f64 = 100.0;

/// DC power-flow solver bound to one device.
#[derive(Debug)]
pub struct PowerFlowModel {
    device: String,
    params: PowerFlowParams,
    /// Reduced susceptance matrix (slack row/column removed), row-major.
    b_reduced: Vec<Vec<f64>>,
    /// Last solved per-line flows [MW].
    flows_mw: Vec<f64>,
}

impl PowerFlowModel {
    /// Build the solver and factor the reduced susceptance matrix.
    pub fn new(device: impl Into<String>, params: PowerFlowParams) -> Self {
        let n = params.buses.len();
        let mut b = vec![vec![0.0; n]; n];
        for line in &params.lines {
            let (i, j, y) = (line.from, line.to, line.susceptance);
            b[i][i] += y;
            b[j][j] += y;
            b[i][j] -= y;
            b[j][i] -= y;
        }
        // Remove the slack bus (index 0).
        let b_reduced = (1..n)
            .map(|i| (1..n).map(|j| b[i][j]).collect())
            .collect();
        Self {
            device: device.into(),
            flows_mw: vec![0.0; params.lines.len()],
            params,
            b_reduced,
        }
    }

    /// Last solved per-line flows [MW], line order as configured.
    pub fn flows_mw(&self) -> &[f64] {
        &self.flows_mw
    }

    /// Net injection at each bus [MW]: generation read from peer telemetry
    /// minus the (overridable) bus load.
    fn injections(&self, fabric: &Fabric) -> PhysicsResult<Vec<f64>> {
        let mut p = Vec::with_capacity(self.params.buses.len());
        for (idx, bus) in self.params.buses.iter().enumerate() {
            let mut generation = 0.0;
            for dev in &bus.generators {
                if let Some(Value::Word(w)) = fabric.read_key(dev, "power_mw")? {
                    generation += f64::from(w) / 10.0;
                }
            }
            let load = fabric
                .read(&self.device, addr::bus_load(idx as u16))?
                .and_then(Value::as_word)
                .unwrap_or(0) as f64
                / 10.0;
            p.push(generation - load);
        }
        Ok(p)
    }
}

impl PhysicsModel for PowerFlowModel {
    fn device(&self) -> &str {
        &self.device
    }

    fn install(&self, fabric: &Fabric) -> PhysicsResult<()> {
        fabric.install(&self.device, |mem| {
            for (idx, bus) in self.params.buses.iter().enumerate() {
                mem.map_word(addr::bus_load(idx as u16), encode_x10(bus.load_mw));
            }
            for idx in 0..self.params.lines.len() as u16 {
                mem.map_bit(addr::line_overload(idx), false);
                mem.map_word(addr::line_flow(idx), 0);
            }
        })?;
        Ok(())
    }

    fn step(&mut self, _dt: f64, fabric: &Fabric) -> PhysicsResult<()> {
        let p_mw = self.injections(fabric)?;
        let n = p_mw.len();
        if n < 2 {
            return Ok(());
        }

        // Solve B'·θ = P' (per-unit, slack removed). θ0 = 0.
        let rhs: Vec<f64> = p_mw[1..].iter().map(|p| p / BASE_MVA).collect();
        let theta_rest = match solve_linear(&self.b_reduced, &rhs) {
            Some(theta) => theta,
            None => {
                warn!(device = %self.device, "power flow: singular susceptance matrix, skipping solve");
                return Ok(());
            }
        };
        let mut theta = vec![0.0; n];
        theta[1..].copy_from_slice(&theta_rest);

        let mut delta = Vec::with_capacity(self.params.lines.len() * 2);
        for (idx, line) in self.params.lines.iter().enumerate() {
            let flow_mw = line.susceptance * (theta[line.from] - theta[line.to]) * BASE_MVA;
            self.flows_mw[idx] = flow_mw;
            let overloaded = flow_mw.abs() > line.rating_mw;
            if overloaded {
                warn!(
                    device = %self.device,
                    line = idx,
                    flow_mw,
                    rating = line.rating_mw,
                    "line overload"
                );
            }
            delta.push((addr::line_overload(idx as u16), Value::Bit(overloaded)));
            delta.push((
                addr::line_flow(idx as u16),
                Value::Word(encode_x10(flow_mw.abs())),
            ));
        }
        fabric.write_bulk(&self.device, &delta)?;
        Ok(())
    }
}

/// Gaussian elimination with partial pivoting. `None` for singular systems.
fn solve_linear(matrix: &[Vec<f64>], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = rhs.len();
    let mut a: Vec<Vec<f64>> = matrix.iter().map(|row| row.clone()).collect();
    let mut b = rhs.to_vec();

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in row + 1..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_common::config::{BusConfig, LineConfig};
    use pal_common::device::{DeviceInfo, DeviceKind};
    use pal_common::events::EventBus;
    use pal_fabric::{ClockMode, SimClock};

    fn three_bus() -> PowerFlowParams {
        PowerFlowParams {
            buses: vec![
                BusConfig {
                    name: "slack".into(),
                    generators: vec!["gen_a".into()],
                    load_mw: 0.0,
                },
                BusConfig {
                    name: "gen".into(),
                    generators: vec!["gen_b".into()],
                    load_mw: 0.0,
                },
                BusConfig {
                    name: "load".into(),
                    generators: vec![],
                    load_mw: 90.0,
                },
            ],
            lines: vec![
                LineConfig { from: 0, to: 1, susceptance: 10.0, rating_mw: 100.0 },
                LineConfig { from: 1, to: 2, susceptance: 10.0, rating_mw: 100.0 },
                LineConfig { from: 0, to: 2, susceptance: 10.0, rating_mw: 40.0 },
            ],
        }
    }

    fn rig(gen_b_x10: u16) -> (Fabric, PowerFlowModel) {
        let fabric = Fabric::new(SimClock::new(ClockMode::Stepped), EventBus::new(16));
        fabric
            .register(DeviceInfo::new("powerflow_rtu_1", DeviceKind::Rtu, 30))
            .unwrap();
        for (name, power_x10) in [("gen_a", 450u16), ("gen_b", gen_b_x10)] {
            fabric
                .register(DeviceInfo::new(name, DeviceKind::Plc, 1))
                .unwrap();
            fabric
                .install(name, |mem| {
                    mem.map_word(AddressKey::input(5), power_x10);
                    mem.alias("power_mw", AddressKey::input(5));
                })
                .unwrap();
        }
        let model = PowerFlowModel::new("powerflow_rtu_1", three_bus());
        model.install(&fabric).unwrap();
        (fabric, model)
    }

    #[test]
    fn solver_handles_identity() {
        let m = vec![vec![1.0, 0.0], vec![0.0, 2.0]];
        let x = solve_linear(&m, &[3.0, 8.0]).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-12);
        assert!((x[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = vec![vec![1.0, 1.0], vec![1.0, 1.0]];
        assert!(solve_linear(&m, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn flows_balance_at_the_load_bus() {
        let (fabric, mut model) = rig(450);
        model.step(0.1, &fabric).unwrap();

        // Line 1 (1→2) and line 2 (0→2) must together deliver the 90 MW load.
        let flows = model.flows_mw();
        let into_load = flows[1] + flows[2];
        assert!((into_load - 90.0).abs() < 0.5, "flows {flows:?}");
    }

    #[test]
    fn overload_coil_raises() {
        // All generation at the slack bus: the direct 0→2 line carries more
        // than its 40 MW rating.
        let (fabric, mut model) = rig(0);
        // Compensate: put the full 90 MW on gen_a.
        fabric
            .install("gen_a", |mem| {
                mem.map_word(AddressKey::input(5), 900);
            })
            .unwrap();
        model.step(0.1, &fabric).unwrap();

        assert_eq!(
            fabric
                .read("powerflow_rtu_1", addr::line_overload(2))
                .unwrap(),
            Some(Value::Bit(true))
        );
        let flow = fabric
            .read("powerflow_rtu_1", addr::line_flow(2))
            .unwrap()
            .and_then(Value::as_word)
            .unwrap();
        assert!(flow > 400);
    }
}
