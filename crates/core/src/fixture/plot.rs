use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use super::{Fixture, Head};
use crate::{Result, StageError};

/// Name of the head written into a freshly created plot.
pub const DEFAULT_FIXTURE_NAME: &str = "Universal";

/// Persisted fixture list, stored as one JSON record per line.
#[derive(Debug, Clone)]
pub struct LightPlot {
    path: PathBuf,
    fixtures: Vec<Fixture>,
}

impl LightPlot {
    /// Loads the plot at `path`. A missing file is created with a single
    /// unpatched head at address 0.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            info!(path = %path.display(), "light plot not found, creating a default one");
            let plot = Self {
                path,
                fixtures: vec![Fixture::Head(Head::unpatched(DEFAULT_FIXTURE_NAME, 0))],
            };
            plot.save()?;
            return Ok(plot);
        }

        let text = fs::read_to_string(&path)?;
        let fixtures = parse_records(&text)?;
        debug!(path = %path.display(), count = fixtures.len(), "light plot loaded");
        Ok(Self { path, fixtures })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fixtures(&self) -> &[Fixture] {
        &self.fixtures
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Fixture> {
        self.fixtures.get(index)
    }

    /// Rewrites the whole file from the in-memory list.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(fs::File::create(&self.path)?);
        for fixture in &self.fixtures {
            serde_json::to_writer(&mut writer, fixture)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Appends a fixture and persists the plot.
    pub fn add(&mut self, fixture: Fixture) -> Result<()> {
        info!(fixture = %fixture, "fixture added");
        self.fixtures.push(fixture);
        self.save()
    }

    /// Removes the fixture at the 0-based `index` and persists the plot.
    /// Returns `None` when the index is out of range.
    pub fn remove(&mut self, index: usize) -> Result<Option<Fixture>> {
        if index >= self.fixtures.len() {
            return Ok(None);
        }
        let removed = self.fixtures.remove(index);
        self.save()?;
        info!(fixture = %removed, "fixture removed");
        Ok(Some(removed))
    }

    /// Human readable listing, numbered from 1.
    pub fn listing(&self) -> Vec<String> {
        self.fixtures
            .iter()
            .enumerate()
            .map(|(i, fixture)| format!("{}. {fixture}", i + 1))
            .collect()
    }
}

fn parse_records(text: &str) -> Result<Vec<Fixture>> {
    let mut fixtures = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| StageError::MalformedFixture {
            line: index + 1,
            reason,
        };

        let record: serde_json::Value =
            serde_json::from_str(line).map_err(|err| malformed(err.to_string()))?;
        let object = record
            .as_object()
            .ok_or_else(|| malformed("expected a JSON object".into()))?;
        if !object.contains_key("type") {
            return Err(malformed("missing type".into()));
        }

        let fixture = serde_json::from_value(record).map_err(|err| malformed(err.to_string()))?;
        fixtures.push(fixture);
    }
    Ok(fixtures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureKind, Param};

    #[test]
    fn missing_file_creates_default_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");

        let plot = LightPlot::load(&path).unwrap();
        assert_eq!(plot.len(), 1);
        let Fixture::Head(head) = &plot.fixtures()[0] else {
            panic!("expected a head");
        };
        assert_eq!(head.name, DEFAULT_FIXTURE_NAME);
        assert_eq!((head.base_pan, head.base_tilt), (127, 127));
        assert!(path.exists());
    }

    #[test]
    fn records_load_by_type_and_skip_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");
        fs::write(
            &path,
            "{\"type\":\"head\",\"name\":\"A\",\"address\":0,\"pan\":1}\n\n{\"type\":\"dimr\",\"name\":\"B\",\"address\":40,\"dim\":1}\n",
        )
        .unwrap();

        let plot = LightPlot::load(&path).unwrap();
        assert_eq!(plot.len(), 2);
        assert_eq!(plot.fixtures()[0].kind(), FixtureKind::Head);
        assert_eq!(plot.fixtures()[1].resolve(Param::Dim).unwrap(), Some(40));
    }

    #[test]
    fn records_without_type_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");
        fs::write(
            &path,
            "{\"type\":\"dimr\",\"name\":\"B\",\"address\":40,\"dim\":1}\n{\"name\":\"A\",\"address\":0,\"dim\":1}\n",
        )
        .unwrap();

        match LightPlot::load(&path).unwrap_err() {
            StageError::MalformedFixture { line, reason } => {
                assert_eq!(line, 2);
                assert_eq!(reason, "missing type");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn saved_plot_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");
        let mut plot = LightPlot::load(&path).unwrap();
        let fixtures = [
            Fixture::build(FixtureKind::Dimmer, "Front", 40, [("dim", 0)]).unwrap(),
            Fixture::build(FixtureKind::Par, "Wash", 12, [("r", 1), ("strobo", 5), ("uv", 4)])
                .unwrap(),
            Fixture::build(
                FixtureKind::Head,
                "Spot",
                100,
                [("pan", 0), ("panF", 1), ("tilt", 2), ("base_pan", 90)],
            )
            .unwrap(),
            Fixture::build(FixtureKind::Hazer, "Fog", 500, [("haze", 0), ("fan", 1)]).unwrap(),
        ];
        for fixture in fixtures {
            plot.add(fixture).unwrap();
        }
        let before = fs::read_to_string(&path).unwrap();

        let reloaded = LightPlot::load(&path).unwrap();
        assert_eq!(reloaded.fixtures(), plot.fixtures());
        reloaded.save().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn malformed_lines_report_their_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");
        fs::write(&path, "{\"type\":\"par\",\"name\":\"A\",\"address\":0}\nnot json\n").unwrap();

        let err = LightPlot::load(&path).unwrap_err();
        assert!(matches!(err, StageError::MalformedFixture { line: 2, .. }));
    }

    #[test]
    fn add_and_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plot.ndjson");
        let mut plot = LightPlot::load(&path).unwrap();

        let par = Fixture::build(FixtureKind::Par, "Wash", 12, [("r", 1), ("dim", 6)]).unwrap();
        plot.add(par.clone()).unwrap();
        assert_eq!(LightPlot::load(&path).unwrap().fixtures()[1], par);

        assert!(plot.remove(5).unwrap().is_none());
        let removed = plot.remove(0).unwrap().unwrap();
        assert_eq!(removed.name(), DEFAULT_FIXTURE_NAME);

        let reloaded = LightPlot::load(&path).unwrap();
        assert_eq!(reloaded.fixtures(), &[par]);
        assert_eq!(reloaded.listing(), vec!["1. par `Wash` @ 13".to_string()]);
    }
}
