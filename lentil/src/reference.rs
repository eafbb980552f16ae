//! Drug-receptor affinities and receptor G-protein classes
//!
//! Both tables are loaded once and passed by reference into the
//! scorer and the classifier.

use crate::common::*;
use matrix_util::common_io::read_lines_of_words_delim;
use fnv::FnvHashMap as HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GProtein {
    Gs,
    Gi,
    Gq,
}

impl FromStr for GProtein {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gs" => Ok(GProtein::Gs),
            "gi" => Ok(GProtein::Gi),
            "gq" => Ok(GProtein::Gq),
            _ => Err(LentilError::configuration(format!(
                "unknown G-protein type '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for GProtein {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GProtein::Gs => write!(f, "Gs"),
            GProtein::Gi => write!(f, "Gi"),
            GProtein::Gq => write!(f, "Gq"),
        }
    }
}

/// `.csv` (optionally gzipped) is comma-separated, anything else tab
fn delimiter_of(file: &str) -> char {
    let lower = file.to_ascii_lowercase();
    if lower.ends_with(".csv") || lower.ends_with(".csv.gz") {
        ','
    } else {
        '\t'
    }
}

fn normalize_name(name: &str) -> Box<str> {
    name.trim().to_uppercase().into_boxed_str()
}

/// Drug × receptor binding affinities; `None` where no affinity is
/// known
#[derive(Clone, Debug)]
pub struct AffinityMatrix {
    drugs: Vec<Box<str>>,
    receptors: Vec<Box<str>>,
    receptor_index: HashMap<Box<str>, usize>,
    /// row-major, drugs × receptors
    values: Vec<Option<f32>>,
}

impl AffinityMatrix {
    /// Names are upper-cased; every present value must be finite and
    /// positive
    pub fn new(
        drugs: Vec<Box<str>>,
        receptors: Vec<Box<str>>,
        values: Vec<Option<f32>>,
    ) -> anyhow::Result<Self> {
        let drugs: Vec<Box<str>> = drugs.iter().map(|d| normalize_name(d)).collect();
        let receptors: Vec<Box<str>> = receptors.iter().map(|r| normalize_name(r)).collect();

        if values.len() != drugs.len() * receptors.len() {
            return Err(LentilError::configuration(format!(
                "{} affinity values for {} drugs x {} receptors",
                values.len(),
                drugs.len(),
                receptors.len()
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for d in drugs.iter() {
            if !seen.insert(d.clone()) {
                return Err(LentilError::configuration(format!(
                    "drug {} appears twice in the affinity table",
                    d
                )));
            }
        }

        let mut receptor_index = HashMap::with_capacity_and_hasher(receptors.len(), Default::default());
        for (j, r) in receptors.iter().enumerate() {
            if receptor_index.insert(r.clone(), j).is_some() {
                return Err(LentilError::configuration(format!(
                    "receptor {} appears twice in the affinity table",
                    r
                )));
            }
        }

        let ncol = receptors.len();
        for (k, v) in values.iter().enumerate() {
            if let Some(x) = v {
                if !x.is_finite() || *x <= 0. {
                    return Err(LentilError::configuration(format!(
                        "affinity of {} for {} must be positive, got {}",
                        drugs[k / ncol],
                        receptors[k % ncol],
                        x
                    )));
                }
            }
        }

        Ok(Self {
            drugs,
            receptors,
            receptor_index,
            values,
        })
    }

    /// Read a table whose header is a corner cell followed by receptor
    /// names and whose rows are a drug name followed by affinities.
    /// Empty, `NA` and `NaN` entries mean no affinity.
    pub fn from_file(file: &str) -> anyhow::Result<Self> {
        let parsed = read_lines_of_words_delim(file, delimiter_of(file), 0)?;
        if parsed.header.len() < 2 {
            return Err(LentilError::configuration(format!(
                "affinity table {} has no receptor columns",
                file
            )));
        }
        let receptors: Vec<Box<str>> = parsed.header[1..].to_vec();
        let ncol = receptors.len();

        let mut drugs = Vec::with_capacity(parsed.lines.len());
        let mut values = Vec::with_capacity(parsed.lines.len() * ncol);

        for (line_no, words) in parsed.lines.iter().enumerate() {
            if words.iter().all(|w| w.trim().is_empty()) {
                continue;
            }
            if words.len() != ncol + 1 {
                return Err(LentilError::configuration(format!(
                    "{}: row {} has {} fields, expected {}",
                    file,
                    line_no + 2,
                    words.len(),
                    ncol + 1
                )));
            }
            drugs.push(words[0].clone());
            for w in words[1..].iter() {
                values.push(parse_affinity(w)?);
            }
        }

        let ret = Self::new(drugs, receptors, values)?;
        info!(
            "affinity table {}: {} drugs x {} receptors",
            file,
            ret.num_drugs(),
            ret.num_receptors()
        );
        Ok(ret)
    }

    pub fn drugs(&self) -> &[Box<str>] {
        &self.drugs
    }

    pub fn receptors(&self) -> &[Box<str>] {
        &self.receptors
    }

    pub fn num_drugs(&self) -> usize {
        self.drugs.len()
    }

    pub fn num_receptors(&self) -> usize {
        self.receptors.len()
    }

    pub fn has_drug(&self, drug: &str) -> bool {
        self.drugs.iter().any(|d| d.as_ref() == drug)
    }

    pub fn has_receptor(&self, receptor: &str) -> bool {
        self.receptor_index.contains_key(receptor)
    }

    /// Affinity of the `d`-th drug for a receptor, if both are known
    pub fn affinity(&self, d: usize, receptor: &str) -> Option<f32> {
        let &j = self.receptor_index.get(receptor)?;
        self.values[d * self.receptors.len() + j]
    }
}

fn parse_affinity(word: &str) -> anyhow::Result<Option<f32>> {
    let w = word.trim();
    if w.is_empty() || w.eq_ignore_ascii_case("na") || w.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let x: f32 = w
        .parse()
        .map_err(|_| LentilError::configuration(format!("invalid affinity value '{}'", w)))?;
    if x.is_nan() {
        Ok(None)
    } else {
        Ok(Some(x))
    }
}

/// Receptor name → G-protein class
#[derive(Clone, Debug, Default)]
pub struct ReceptorTypeTable {
    types: HashMap<Box<str>, GProtein>,
}

impl ReceptorTypeTable {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, GProtein)>,
        S: AsRef<str>,
    {
        Self {
            types: entries
                .into_iter()
                .map(|(r, g)| (normalize_name(r.as_ref()), g))
                .collect(),
        }
    }

    /// Read a table with `receptor_name` and `type` columns; rows of
    /// unknown type are skipped with a warning
    pub fn from_file(file: &str) -> anyhow::Result<Self> {
        let parsed = read_lines_of_words_delim(file, delimiter_of(file), 0)?;
        let column = |name: &str| -> anyhow::Result<usize> {
            parsed
                .header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    LentilError::configuration(format!("{} has no '{}' column", file, name))
                })
        };
        let name_col = column("receptor_name")?;
        let type_col = column("type")?;

        let mut types = HashMap::default();
        for words in parsed.lines.iter() {
            let (Some(name), Some(kind)) = (words.get(name_col), words.get(type_col)) else {
                continue;
            };
            if name.trim().is_empty() {
                continue;
            }
            match kind.parse::<GProtein>() {
                Ok(g) => {
                    types.insert(normalize_name(name), g);
                }
                Err(_) => warn!("receptor {}: skipping unknown type '{}'", name, kind),
            }
        }

        info!("receptor type table {}: {} receptors", file, types.len());
        Ok(Self { types })
    }

    pub fn get(&self, receptor: &str) -> Option<GProtein> {
        self.types.get(receptor).copied()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Immutable reference tables threaded through scoring and
/// selectivity
#[derive(Clone, Debug)]
pub struct ReferenceTables {
    pub affinity: AffinityMatrix,
    pub receptor_types: ReceptorTypeTable,
}

impl ReferenceTables {
    pub fn new(affinity: AffinityMatrix, receptor_types: ReceptorTypeTable) -> Self {
        Self {
            affinity,
            receptor_types,
        }
    }

    pub fn from_files(affinity_file: &str, receptor_type_file: &str) -> anyhow::Result<Self> {
        Ok(Self::new(
            AffinityMatrix::from_file(affinity_file)?,
            ReceptorTypeTable::from_file(receptor_type_file)?,
        ))
    }
}
