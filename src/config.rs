use std::{collections::HashMap, path::PathBuf};

use crate::error::EngineError;

/// engine configuration; string keys accepted by [`GraphConfig::from_map`]
/// match the field names
#[derive(Clone, Debug)]
pub struct GraphConfig {
    /// number of worker threads; must be a multiple of `num_nodes`
    pub num_threads: usize,
    /// number of NUMA nodes workers are spread over
    pub num_nodes: usize,
    /// per-worker cap on vertices with outstanding I/O
    pub max_processing_vertices: usize,
    /// when set, submitted request batches are emitted as trace events
    pub trace_file: Option<PathBuf>,
    /// log per-worker I/O statistics at shutdown
    pub print_io_stat: bool,
    /// profiler output path; recognized but unused by the engine core
    pub prof_file: Option<PathBuf>,
    /// capacity of a worker's inbound batch queue
    pub msg_queue_cap: usize,
    /// flush threshold of an outbound sender buffer in bytes
    pub msg_buf_bytes: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_threads: num_cpus::get(),
            num_nodes: 1,
            max_processing_vertices: 2048,
            trace_file: None,
            print_io_stat: false,
            prof_file: None,
            msg_queue_cap: 1 << 16,
            msg_buf_bytes: 4096,
        }
    }
}

impl GraphConfig {
    /// build a config from string key/value pairs. Keys the engine does not
    /// recognize are ignored; shared config files also carry I/O-layer keys.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, EngineError> {
        let mut conf = Self::default();
        for (k, v) in map {
            match k.as_str() {
                "num_threads" => conf.num_threads = parse_usize(k, v)?,
                "num_nodes" => conf.num_nodes = parse_usize(k, v)?,
                "max_processing_vertices" => {
                    conf.max_processing_vertices = parse_usize(k, v)?
                }
                "trace_file" => conf.trace_file = Some(PathBuf::from(v)),
                "print_io_stat" => conf.print_io_stat = parse_bool(k, v)?,
                "prof_file" => conf.prof_file = Some(PathBuf::from(v)),
                _ => {}
            }
        }
        conf.validate()?;
        Ok(conf)
    }

    /// check the invariants the engine relies on
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.num_threads == 0 || self.num_nodes == 0 {
            return Err(EngineError::Config(
                "num_threads and num_nodes must be positive".into(),
            ));
        }
        if self.num_threads % self.num_nodes != 0 {
            return Err(EngineError::Config(format!(
                "num_threads ({}) must be a multiple of num_nodes ({})",
                self.num_threads, self.num_nodes
            )));
        }
        if self.max_processing_vertices == 0 {
            return Err(EngineError::Config(
                "max_processing_vertices must be positive".into(),
            ));
        }
        if self.msg_queue_cap == 0 || self.msg_buf_bytes == 0 {
            return Err(EngineError::Config(
                "message queue capacity and buffer size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_usize(key: &str, v: &str) -> Result<usize, EngineError> {
    v.parse()
        .map_err(|_| EngineError::Config(format!("invalid value for {}: {}", key, v)))
}

fn parse_bool(key: &str, v: &str) -> Result<bool, EngineError> {
    match v {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "invalid value for {}: {}",
            key, v
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        GraphConfig::default().validate().unwrap();
    }

    #[test]
    fn thread_node_ratio_is_checked() {
        let conf = GraphConfig {
            num_threads: 5,
            num_nodes: 2,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn from_map_parses_known_keys() {
        let mut map = HashMap::new();
        map.insert("num_threads".to_string(), "4".to_string());
        map.insert("num_nodes".to_string(), "2".to_string());
        map.insert("print_io_stat".to_string(), "true".to_string());
        map.insert("io_depth".to_string(), "128".to_string());
        let conf = GraphConfig::from_map(&map).unwrap();
        assert_eq!(conf.num_threads, 4);
        assert_eq!(conf.num_nodes, 2);
        assert!(conf.print_io_stat);
    }

    #[test]
    fn from_map_rejects_garbage() {
        let mut map = HashMap::new();
        map.insert("num_threads".to_string(), "many".to_string());
        assert!(GraphConfig::from_map(&map).is_err());
    }
}
