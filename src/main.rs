use statesim::config::SimulationConfig;

fn main() -> Result<(), anyhow::Error> {
    statesim::init_logging()?;
    statesim::start(SimulationConfig::default())
}
