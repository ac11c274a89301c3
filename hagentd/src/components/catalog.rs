use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hagent_wire::protocol::Component;
use tracing::{info, warn};

use super::{Configuration, InvalidValue, ParamKind, ParamLookup, ParamSpec};
use crate::config::AgentConfig;

fn int(name: &str, aliases: &[&str], file: &str, min: i64, max: i64) -> ParamSpec {
    param(name, aliases, file, ParamKind::Int { min, max })
}

fn param(name: &str, aliases: &[&str], file: &str, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
        file: file.to_string(),
        kind,
    }
}

/// Parameters every installation knows about without configuration.
pub fn builtin_params(component: Component) -> Vec<ParamSpec> {
    const GIB_MB: i64 = 1024;
    match component {
        Component::Hdfs => vec![
            int("dfs.replication", &["hdfs.replication", "replication"], "hdfs-site.xml", 1, 512),
            int("dfs.blocksize", &["hdfs.blocksize"], "hdfs-site.xml", 1 << 20, 1 << 40),
            param("dfs.namenode.name.dir", &["hdfs.namenode.dir"], "hdfs-site.xml", ParamKind::Path),
            param("dfs.datanode.data.dir", &["hdfs.datanode.dir"], "hdfs-site.xml", ParamKind::Path),
            param("dfs.permissions.enabled", &["hdfs.permissions"], "hdfs-site.xml", ParamKind::Bool),
            param("fs.defaultFS", &["hdfs.default.fs"], "core-site.xml", ParamKind::Text),
        ],
        Component::Yarn => vec![
            int("yarn.nodemanager.resource.memory-mb", &["yarn.nm.memory"], "yarn-site.xml", 256, 1024 * GIB_MB),
            int("yarn.nodemanager.resource.cpu-vcores", &["yarn.nm.vcores"], "yarn-site.xml", 1, 1024),
            int("yarn.scheduler.minimum-allocation-mb", &["yarn.min.allocation"], "yarn-site.xml", 1, 64 * GIB_MB),
            int("yarn.scheduler.maximum-allocation-mb", &["yarn.max.allocation"], "yarn-site.xml", 1, 1024 * GIB_MB),
            param("yarn.resourcemanager.hostname", &["yarn.rm.host"], "yarn-site.xml", ParamKind::Text),
        ],
        Component::MapReduce => vec![
            int("mapreduce.map.memory.mb", &["mapreduce.map.memory"], "mapred-site.xml", 128, 64 * GIB_MB),
            int("mapreduce.reduce.memory.mb", &["mapreduce.reduce.memory"], "mapred-site.xml", 128, 64 * GIB_MB),
            int("mapreduce.job.reduces", &["mapreduce.reduces"], "mapred-site.xml", 0, 100_000),
            param("mapreduce.framework.name", &["mapreduce.framework"], "mapred-site.xml", ParamKind::Text),
        ],
        Component::HBase => vec![
            int("hbase.regionserver.handler.count", &["hbase.handlers"], "hbase-site.xml", 1, 1000),
            int("hbase.hregion.max.filesize", &["hbase.region.size"], "hbase-site.xml", 1 << 20, 1 << 40),
            param("hbase.rootdir", &["hbase.root"], "hbase-site.xml", ParamKind::Text),
            param("hbase.cluster.distributed", &["hbase.distributed"], "hbase-site.xml", ParamKind::Bool),
        ],
        Component::ZooKeeper => vec![
            int("tickTime", &["zookeeper.tick.time"], "zoo.cfg", 1, 60_000),
            int("initLimit", &["zookeeper.init.limit"], "zoo.cfg", 1, 1000),
            int("syncLimit", &["zookeeper.sync.limit"], "zoo.cfg", 1, 1000),
            int("clientPort", &["zookeeper.client.port"], "zoo.cfg", 1, 65535),
            param("dataDir", &["zookeeper.data.dir"], "zoo.cfg", ParamKind::Path),
        ],
        Component::Kafka => vec![
            int("num.partitions", &["kafka.partitions"], "server.properties", 1, 10_000),
            int("log.retention.hours", &["kafka.retention.hours"], "server.properties", 1, 1_000_000),
            int("default.replication.factor", &["kafka.replication"], "server.properties", 1, 32),
            param("log.dirs", &["kafka.log.dirs"], "server.properties", ParamKind::Path),
            param("auto.create.topics.enable", &["kafka.auto.create"], "server.properties", ParamKind::Bool),
        ],
        Component::Spark => vec![
            param("spark.executor.memory", &["spark.memory"], "spark-defaults.conf", ParamKind::Text),
            int("spark.executor.cores", &["spark.cores"], "spark-defaults.conf", 1, 1024),
            param("spark.eventLog.enabled", &["spark.event.log"], "spark-defaults.conf", ParamKind::Bool),
            param("spark.eventLog.dir", &["spark.event.log.dir"], "spark-defaults.conf", ParamKind::Text),
        ],
    }
}

#[derive(Debug, Clone)]
struct Entry {
    install_dir: PathBuf,
    config_dir: PathBuf,
    params: Vec<ParamSpec>,
}

impl Entry {
    fn find(&self, raw_name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.matches(raw_name))
    }
}

/// Catalogue-backed [`Configuration`].
///
/// A component counts as installed when its install directory exists.
/// Accepted values are recorded as `key=value` lines in
/// `<config_dir>/<file>.overrides`; the component's own file format is never
/// touched.
#[derive(Debug, Clone)]
pub struct CatalogConfiguration {
    entries: BTreeMap<Component, Entry>,
}

impl CatalogConfiguration {
    pub fn from_config(config: &AgentConfig) -> Self {
        let entries = Component::ALL
            .into_iter()
            .map(|component| {
                let settings = config.component(component);
                let mut params = builtin_params(component);
                if let Some(settings) = settings {
                    for extra in &settings.params {
                        match params.iter_mut().find(|p| p.name == extra.name) {
                            Some(existing) => *existing = extra.clone(),
                            None => params.push(extra.clone()),
                        }
                    }
                }
                let id = component.id();
                let entry = Entry {
                    install_dir: settings
                        .and_then(|s| s.install_dir.clone())
                        .unwrap_or_else(|| PathBuf::from(format!("/opt/{id}"))),
                    config_dir: settings
                        .and_then(|s| s.config_dir.clone())
                        .unwrap_or_else(|| PathBuf::from(format!("/etc/{id}/conf"))),
                    params,
                };
                (component, entry)
            })
            .collect();
        Self { entries }
    }

    fn entry(&self, component: Component) -> &Entry {
        // Every component gets an entry in from_config.
        &self.entries[&component]
    }

    pub fn overrides_path(&self, component: Component, file: &str) -> PathBuf {
        self.entry(component)
            .config_dir
            .join(format!("{file}.overrides"))
    }
}

impl Configuration for CatalogConfiguration {
    fn is_installed(&self, component: Component) -> bool {
        self.entry(component).install_dir.is_dir()
    }

    fn lookup_canonical_param(&self, component: Component, raw_name: &str) -> Option<ParamLookup> {
        self.entry(component).find(raw_name).map(|spec| ParamLookup {
            canonical_name: spec.name.clone(),
            config_file: spec.file.clone(),
        })
    }

    fn validate(&self, component: Component, name: &str, value: &str) -> Result<(), InvalidValue> {
        match self.entry(component).find(name) {
            Some(spec) => spec.kind.check(value),
            None => Ok(()),
        }
    }

    fn apply_config(&self, component: Component, name: &str, value: &str, file: &str) -> String {
        let path = self.overrides_path(component, file);
        match write_override(&path, name, value.trim()) {
            Ok(()) => {
                info!(component = component.id(), name, value, path = %path.display(), "parameter updated");
                format!("{component} parameter {name} set to {} in {file}.\n", value.trim())
            }
            Err(err) => {
                warn!(component = component.id(), name, path = %path.display(), %err, "could not update overrides");
                format!("Could not update {file} for {component}: {err}\n")
            }
        }
    }
}

/// Replace or append `name=value` and swap the file in with a rename.
fn write_override(path: &Path, name: &str, value: &str) -> std::io::Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(err),
    };

    let mut lines: Vec<String> = Vec::new();
    let mut replaced = false;
    for line in existing.lines() {
        let key = line.split_once('=').map(|(k, _)| k.trim());
        if key == Some(name) {
            if !replaced {
                lines.push(format!("{name}={value}"));
                replaced = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }
    if !replaced {
        lines.push(format!("{name}={value}"));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let tmp = path.with_extension(format!("overrides.tmp.{}", std::process::id()));
    {
        let mut out = fs::File::create(&tmp)?;
        for line in &lines {
            writeln!(out, "{line}")?;
        }
        out.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}
