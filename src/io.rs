//! Safetensors-backed [`SignalStore`].
//!
//! On-disk layout:
//!
//! ```text
//! <recordings>/<subject>.safetensors   data [C,T,N] F64|F32, times [T], sfreq [1],
//!                                      codes [N] I32, rt [N] F64, trial_index [N] I32
//!                                      __metadata__: ch_names (JSON list)
//! <output>/<artifact>.safetensors      data [C,T,N] F64, times [T], sfreq [1]
//!                                      __metadata__: name, ch_names, subjects (JSON)
//! <output>/<table>.json                pretty-printed JSON
//! ```
//!
//! Artifacts are looked up in the output directory first, then in the
//! directory of a previous run when one is attached (load mode).
use ndarray::Array3;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::condition::ConditionCode;
use crate::error::StoreError;
use crate::recording::{SubjectId, SubjectRecording, TrialMeta};
use crate::store::{ArrayMeta, LabeledArray, Layout, SignalStore};

// ── Low-level safetensors parser ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// A parsed safetensors file: tensor table, free-form metadata, raw bytes.
struct StFile {
    name: String,
    tensors: HashMap<String, TensorInfo>,
    metadata: HashMap<String, String>,
    bytes: Vec<u8>,
    data_start: usize,
}

impl StFile {
    fn parse(name: &str, bytes: Vec<u8>) -> Result<Self, StoreError> {
        let malformed = |reason: String| StoreError::Malformed { name: name.to_string(), reason };
        if bytes.len() < 8 {
            return Err(malformed("safetensors file too small".into()));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[..8]);
        let n = u64::from_le_bytes(len) as usize;
        let header_end = 8usize
            .checked_add(n)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| malformed(format!("header length {n} exceeds file size")))?;
        let mut raw: HashMap<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..header_end])?;
        let metadata = match raw.remove("__metadata__") {
            Some(m) => serde_json::from_value(m)?,
            None => HashMap::new(),
        };
        let mut tensors = HashMap::new();
        for (key, value) in raw {
            let info: TensorInfo = serde_json::from_value(value)?;
            let [s, e] = info.data_offsets;
            if s > e || header_end.checked_add(e).map_or(true, |end| end > bytes.len()) {
                return Err(malformed(format!("tensor '{key}' lies outside the file")));
            }
            tensors.insert(key, info);
        }
        Ok(Self { name: name.to_string(), tensors, metadata, bytes, data_start: header_end })
    }

    fn read(path: &Path, name: &str) -> Result<Self, StoreError> {
        Self::parse(name, std::fs::read(path)?)
    }

    fn malformed(&self, reason: impl Into<String>) -> StoreError {
        StoreError::Malformed { name: self.name.clone(), reason: reason.into() }
    }

    fn has(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    fn entry(&self, key: &str) -> Result<(&TensorInfo, &[u8]), StoreError> {
        let info = self
            .tensors
            .get(key)
            .ok_or_else(|| self.malformed(format!("missing '{key}' tensor")))?;
        let [s, e] = info.data_offsets;
        Ok((info, &self.bytes[self.data_start + s..self.data_start + e]))
    }

    fn shape_of(&self, key: &str) -> Result<&[usize], StoreError> {
        Ok(&self.entry(key)?.0.shape)
    }

    /// Float tensor widened to `f64`; accepts F64 and F32.
    fn read_f64(&self, key: &str) -> Result<Vec<f64>, StoreError> {
        let (info, raw) = self.entry(key)?;
        let out: Vec<f64> = match info.dtype.as_str() {
            "F64" => raw
                .chunks_exact(8)
                .map(|b| {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(b);
                    f64::from_le_bytes(a)
                })
                .collect(),
            "F32" => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect(),
            other => return Err(self.malformed(format!("'{key}': unsupported dtype {other}"))),
        };
        self.check_len(key, info, out.len())?;
        Ok(out)
    }

    fn read_i32(&self, key: &str) -> Result<Vec<i32>, StoreError> {
        let (info, raw) = self.entry(key)?;
        if info.dtype != "I32" {
            return Err(self.malformed(format!("'{key}': expected I32, found {}", info.dtype)));
        }
        let out: Vec<i32> = raw
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        self.check_len(key, info, out.len())?;
        Ok(out)
    }

    fn check_len(&self, key: &str, info: &TensorInfo, n: usize) -> Result<(), StoreError> {
        let expected = info.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if expected != Some(n) {
            return Err(self.malformed(format!("'{key}': shape {:?} but {n} values", info.shape)));
        }
        Ok(())
    }

    fn read_array3(&self, key: &str) -> Result<Array3<f64>, StoreError> {
        let shape = self.shape_of(key)?.to_vec();
        let &[c, t, n] = shape.as_slice() else {
            return Err(self.malformed(format!("'{key}': expected 3 dims, found {shape:?}")));
        };
        let data = self.read_f64(key)?;
        Array3::from_shape_vec((c, t, n), data).map_err(|e| self.malformed(e.to_string()))
    }

    fn meta_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let raw = self
            .metadata
            .get(key)
            .ok_or_else(|| self.malformed(format!("missing metadata '{key}'")))?;
        Ok(serde_json::from_str(raw)?)
    }

    fn scalar_f64(&self, key: &str) -> Result<f64, StoreError> {
        self.read_f64(key)?
            .first()
            .copied()
            .ok_or_else(|| self.malformed(format!("'{key}' is empty")))
    }
}

// ── Generic safetensors builder ──────────────────────────────────────────────

/// Minimal safetensors writer for F32, F64 and I32 tensors plus string
/// metadata.
///
/// ```rust,no_run
/// use erp_post::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new();
/// w.add_f64("signal", &[1.0, 2.0, 3.0], &[1, 3]);
/// w.add_metadata("note", "demo");
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f32(&mut self, name: &str, data: &[f32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F32", shape.to_vec()));
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    pub fn add_f64_arr3(&mut self, name: &str, arr: &Array3<f64>) {
        let (c, t, n) = arr.dim();
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[c, t, n]);
    }

    pub fn add_i32(&mut self, name: &str, data: &[i32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I32", shape.to_vec()));
    }

    pub fn add_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), serde_json::Value::String(value.into()));
    }

    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        use std::io::Write;
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map.insert("__metadata__".into(), self.metadata.clone().into());
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let padded: Vec<u8> = hdr_bytes
            .into_iter()
            .chain(std::iter::repeat_n(b' ', pad))
            .collect();
        let mut f = std::io::BufWriter::new(std::fs::File::create(path)?);
        f.write_all(&(padded.len() as u64).to_le_bytes())?;
        f.write_all(&padded)?;
        for (_, data, _, _) in &self.entries {
            f.write_all(data)?;
        }
        f.flush()?;
        Ok(())
    }
}

// ── Recordings ───────────────────────────────────────────────────────────────

/// Write one subject's recording in the layout [`SafetensorsStore`] reads.
pub fn write_recording(path: &Path, rec: &SubjectRecording) -> Result<(), StoreError> {
    let n = rec.trials.len();
    let mut w = StWriter::new();
    w.add_f64_arr3("data", &rec.data);
    w.add_f64("times", &rec.times_s, &[rec.times_s.len()]);
    w.add_f64("sfreq", &[rec.sfreq], &[1]);
    let codes: Vec<i32> = rec.trials.iter().map(|t| i32::from(t.code.0)).collect();
    let rts: Vec<f64> = rec.trials.iter().map(|t| t.rt_s).collect();
    let index: Vec<i32> = rec.trials.iter().map(|t| t.index as i32).collect();
    w.add_i32("codes", &codes, &[n]);
    w.add_f64("rt", &rts, &[n]);
    w.add_i32("trial_index", &index, &[n]);
    w.add_metadata("subject", rec.subject.as_str());
    w.add_metadata("ch_names", serde_json::to_string(&rec.ch_names)?);
    w.write(path)
}

fn parse_recording(subject: &SubjectId, st: &StFile) -> Result<SubjectRecording, StoreError> {
    let data = st.read_array3("data")?;
    if !st.has("codes") || !st.has("rt") {
        return Err(StoreError::MissingMetadata { subject: subject.clone() });
    }
    let codes = st.read_i32("codes")?;
    let rts = st.read_f64("rt")?;
    let index = if st.has("trial_index") {
        st.read_i32("trial_index")?
    } else {
        (0..codes.len() as i32).collect()
    };
    if rts.len() != codes.len() || index.len() != codes.len() {
        return Err(st.malformed("codes, rt and trial_index differ in length"));
    }
    let trials = codes
        .iter()
        .zip(&rts)
        .zip(&index)
        .map(|((&code, &rt_s), &i)| {
            let code = u16::try_from(code)
                .map_err(|_| st.malformed(format!("condition code {code} out of range")))?;
            let index = u32::try_from(i)
                .map_err(|_| st.malformed(format!("negative trial index {i}")))?;
            Ok(TrialMeta { code: ConditionCode(code), rt_s, index })
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    let rec = SubjectRecording {
        subject: subject.clone(),
        ch_names: st.meta_json("ch_names")?,
        sfreq: st.scalar_f64("sfreq")?,
        times_s: st.read_f64("times")?,
        data,
        trials,
    };
    rec.validate()?;
    Ok(rec)
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct SafetensorsStore {
    recordings: PathBuf,
    output: PathBuf,
    previous: Option<PathBuf>,
}

impl SafetensorsStore {
    /// Read recordings from `recordings`, write artifacts to `output`
    /// (created if missing).
    pub fn new(recordings: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let output = output.into();
        std::fs::create_dir_all(&output)?;
        Ok(Self { recordings: recordings.into(), output, previous: None })
    }

    /// Fall back to a previous run's artifacts for anything not yet written.
    pub fn with_previous_run(mut self, dir: impl Into<PathBuf>) -> Self {
        self.previous = Some(dir.into());
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output
    }

    pub fn recording_path(&self, subject: &SubjectId) -> PathBuf {
        self.recordings.join(format!("{subject}.safetensors"))
    }

    /// Existing file for `file_name`, output directory first.
    fn find(&self, file_name: &str) -> Option<PathBuf> {
        std::iter::once(&self.output)
            .chain(self.previous.as_ref())
            .map(|dir| dir.join(file_name))
            .find(|p| p.is_file())
    }
}

impl SignalStore for SafetensorsStore {
    fn load_subject(&self, subject: &SubjectId) -> Result<SubjectRecording, StoreError> {
        let path = self.recording_path(subject);
        if !path.is_file() {
            return Err(StoreError::NotFound(subject.clone()));
        }
        debug!(subject = %subject, path = %path.display(), "loading recording");
        // A corrupt header only costs this subject.
        StFile::read(&path, subject.as_str())
            .and_then(|st| parse_recording(subject, &st))
            .map_err(|e| match e {
                StoreError::Json(j) => StoreError::Malformed {
                    name: subject.to_string(),
                    reason: j.to_string(),
                },
                other => other,
            })
    }

    fn save_array(&self, array: &LabeledArray) -> Result<(), StoreError> {
        let meta = &array.meta;
        let mut w = StWriter::new();
        w.add_f64_arr3("data", &array.data);
        w.add_f64("times", &meta.layout.times_s, &[meta.layout.times_s.len()]);
        w.add_f64("sfreq", &[meta.layout.sfreq], &[1]);
        w.add_metadata("name", meta.name.as_str());
        w.add_metadata("ch_names", serde_json::to_string(&meta.layout.ch_names)?);
        w.add_metadata("subjects", serde_json::to_string(&meta.subjects)?);
        let path = self.output.join(format!("{}.safetensors", meta.name));
        debug!(artifact = %meta.name, path = %path.display(), "writing array");
        w.write(&path)
    }

    fn load_array(&self, name: &str) -> Result<LabeledArray, StoreError> {
        let path = self
            .find(&format!("{name}.safetensors"))
            .ok_or_else(|| StoreError::MissingArtifact(name.to_string()))?;
        let st = StFile::read(&path, name)?;
        let data = st.read_array3("data")?;
        let meta = ArrayMeta {
            name: name.to_string(),
            layout: Layout {
                ch_names: st.meta_json("ch_names")?,
                sfreq: st.scalar_f64("sfreq")?,
                times_s: st.read_f64("times")?,
            },
            subjects: st.meta_json("subjects")?,
        };
        let (c, t, n) = data.dim();
        if c != meta.layout.n_channels() || t != meta.layout.n_times() || n != meta.subjects.len() {
            return Err(st.malformed(format!(
                "data is {c}×{t}×{n} but metadata lists {} channels, {} times, {} subjects",
                meta.layout.n_channels(),
                meta.layout.n_times(),
                meta.subjects.len()
            )));
        }
        Ok(LabeledArray { data, meta })
    }

    fn save_table(&self, name: &str, table: &serde_json::Value) -> Result<(), StoreError> {
        let path = self.output.join(format!("{name}.json"));
        std::fs::write(&path, serde_json::to_vec_pretty(table)?)?;
        Ok(())
    }

    fn load_table(&self, name: &str) -> Result<serde_json::Value, StoreError> {
        let path = self
            .find(&format!("{name}.json"))
            .ok_or_else(|| StoreError::MissingArtifact(name.to_string()))?;
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn recording(subject: &str) -> SubjectRecording {
        SubjectRecording {
            subject: subject.into(),
            ch_names: vec!["Cz".into(), "Pz".into()],
            sfreq: 250.0,
            times_s: vec![0.0, 0.004, 0.008],
            data: Array3::from_shape_fn((2, 3, 2), |(c, t, n)| (c * 100 + t * 10 + n) as f64),
            trials: vec![
                TrialMeta { code: ConditionCode(111), rt_s: 0.45, index: 3 },
                TrialMeta { code: ConditionCode(212), rt_s: 0.61, index: 7 },
            ],
        }
    }

    #[test]
    fn recording_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path().join("out")).unwrap();
        let rec = recording("sub-01");
        write_recording(&store.recording_path(&rec.subject), &rec).unwrap();

        let back = store.load_subject(&rec.subject).unwrap();
        assert_eq!(back.ch_names, rec.ch_names);
        assert_eq!(back.times_s, rec.times_s);
        assert_eq!(back.trials, rec.trials);
        assert_eq!(back.data, rec.data);
    }

    #[test]
    fn absent_recording_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        assert!(matches!(
            store.load_subject(&"ghost".into()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn recording_without_labels_is_missing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        let rec = recording("sub-02");
        let mut w = StWriter::new();
        w.add_f64_arr3("data", &rec.data);
        w.add_f64("times", &rec.times_s, &[3]);
        w.add_f64("sfreq", &[rec.sfreq], &[1]);
        w.add_metadata("ch_names", serde_json::to_string(&rec.ch_names).unwrap());
        w.write(&store.recording_path(&rec.subject)).unwrap();
        assert!(matches!(
            store.load_subject(&rec.subject),
            Err(StoreError::MissingMetadata { .. })
        ));
    }

    #[test]
    fn truncated_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        std::fs::write(store.recording_path(&"bad".into()), [1u8, 2, 3]).unwrap();
        let err = store.load_subject(&"bad".into()).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert!(err.is_per_subject());
    }

    /// Raw file: header JSON, then `payload` bytes.
    fn write_raw(path: &Path, header: &str, payload: &[u8]) {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn overflowing_offsets_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        let header = format!(
            r#"{{"data":{{"dtype":"F64","shape":[1,1,1],"data_offsets":[0,{}]}}}}"#,
            usize::MAX
        );
        write_raw(&store.recording_path(&"huge".into()), &header, &[0u8; 8]);
        let err = store.load_subject(&"huge".into()).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
        assert!(err.is_per_subject());
    }

    #[test]
    fn overflowing_shape_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        let header = format!(
            r#"{{"data":{{"dtype":"F64","shape":[{},2,1],"data_offsets":[0,8]}}}}"#,
            usize::MAX
        );
        write_raw(&store.recording_path(&"wide".into()), &header, &[0u8; 8]);
        let err = store.load_subject(&"wide".into()).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[test]
    fn f32_recordings_are_widened() {
        let dir = tempfile::tempdir().unwrap();
        let store = SafetensorsStore::new(dir.path(), dir.path()).unwrap();
        let rec = recording("sub-03");
        let mut w = StWriter::new();
        let data: Vec<f32> = rec.data.iter().map(|&v| v as f32).collect();
        w.add_f32("data", &data, &[2, 3, 2]);
        w.add_f64("times", &rec.times_s, &[3]);
        w.add_f64("sfreq", &[rec.sfreq], &[1]);
        w.add_i32("codes", &[111, 212], &[2]);
        w.add_f64("rt", &[0.45, 0.61], &[2]);
        w.add_metadata("ch_names", serde_json::to_string(&rec.ch_names).unwrap());
        w.write(&store.recording_path(&rec.subject)).unwrap();
        let back = store.load_subject(&rec.subject).unwrap();
        assert_eq!(back.data, rec.data);
        assert_eq!(back.trials[1].index, 1);
    }

    #[test]
    fn artifacts_fall_back_to_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let prev = SafetensorsStore::new(dir.path(), dir.path().join("run1")).unwrap();
        let layout = Layout::of(&recording("x"));
        let array = LabeledArray {
            data: Array3::from_elem((2, 3, 1), 1.5),
            meta: ArrayMeta {
                name: "grand_average_111".into(),
                layout,
                subjects: vec!["sub-01".into()],
            },
        };
        prev.save_array(&array).unwrap();
        prev.save_table("inclusion", &serde_json::json!({ "ok": true })).unwrap();

        let next = SafetensorsStore::new(dir.path(), dir.path().join("run2"))
            .unwrap()
            .with_previous_run(dir.path().join("run1"));
        assert_eq!(next.load_array("grand_average_111").unwrap(), array);
        assert_eq!(next.load_table("inclusion").unwrap()["ok"], true);
        assert!(matches!(next.load_array("nope"), Err(StoreError::MissingArtifact(_))));
    }
}
