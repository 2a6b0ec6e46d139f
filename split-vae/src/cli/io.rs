use anyhow::anyhow;
use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Open a file for reading, gzipped or not
pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match Path::new(input_file).extension().and_then(OsStr::to_str) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Open a file for writing, gzipped if it ends with `.gz`
pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn Write>> {
    match output_file {
        "stdout" => Ok(Box::new(BufWriter::new(std::io::stdout()))),
        "stderr" => Ok(Box::new(BufWriter::new(std::io::stderr()))),
        _ => {
            let file = File::create(output_file)?;
            match Path::new(output_file).extension().and_then(OsStr::to_str) {
                Some("gz") => Ok(Box::new(BufWriter::new(GzEncoder::new(
                    file,
                    Compression::default(),
                )))),
                _ => Ok(Box::new(BufWriter::new(file))),
            }
        }
    }
}

/// Create the parent directory of `file` if needed
pub fn mkdir(file: &str) -> anyhow::Result<()> {
    if let Some(dir) = Path::new(file).parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

fn is_data_line(line: &str) -> bool {
    !(line.trim().is_empty() || line.starts_with('#') || line.starts_with('%'))
}

fn split_words(line: &str) -> impl Iterator<Item = &str> {
    line.split(['\t', ',', ' ']).filter(|w| !w.is_empty())
}

/// Read a delimited numeric matrix (rows = cells) into an `f32`
/// tensor. Lines starting with `#` or `%` are skipped.
pub fn read_matrix(input_file: &str, device: &Device) -> anyhow::Result<Tensor> {
    let mut values = vec![];
    let mut n_rows = 0;
    let mut n_cols = None;

    for (i, line) in open_buf_reader(input_file)?.lines().enumerate() {
        let line = line?;
        if !is_data_line(&line) {
            continue;
        }
        let row = split_words(&line)
            .map(|w| w.parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow!("{}:{}: {}", input_file, i + 1, e))?;

        match n_cols {
            None => n_cols = Some(row.len()),
            Some(d) if d != row.len() => {
                return Err(anyhow!(
                    "{}:{}: found {} columns, expected {}",
                    input_file,
                    i + 1,
                    row.len(),
                    d
                ));
            }
            _ => {}
        }
        values.extend(row);
        n_rows += 1;
    }

    let n_cols = n_cols.ok_or(anyhow!("empty matrix: {}", input_file))?;
    Ok(Tensor::from_vec(values, (n_rows, n_cols), device)?)
}

/// Categorical labels, one column per covariate, coded in order of
/// first appearance
pub struct CategoricalCodes {
    /// codes (n x k, `u32`)
    pub codes: Tensor,
    pub n_cats_per_cov: Vec<usize>,
    pub labels: Vec<Vec<Box<str>>>,
}

/// Read one or more columns of categorical labels
pub fn read_categorical(input_file: &str, device: &Device) -> anyhow::Result<CategoricalCodes> {
    let mut rows: Vec<Vec<Box<str>>> = vec![];
    for line in open_buf_reader(input_file)?.lines() {
        let line = line?;
        if is_data_line(&line) {
            rows.push(split_words(&line).map(Box::from).collect());
        }
    }

    let k = rows.first().map(|r| r.len()).unwrap_or(0);
    if k == 0 {
        return Err(anyhow!("no categorical labels in {}", input_file));
    }
    if rows.iter().any(|r| r.len() != k) {
        return Err(anyhow!("ragged categorical labels in {}", input_file));
    }

    let mut dictionaries: Vec<HashMap<Box<str>, u32>> = vec![HashMap::new(); k];
    let mut labels: Vec<Vec<Box<str>>> = vec![vec![]; k];
    let mut codes = Vec::with_capacity(rows.len() * k);

    for row in &rows {
        for (j, word) in row.iter().enumerate() {
            let next = dictionaries[j].len() as u32;
            let code = *dictionaries[j].entry(word.clone()).or_insert_with(|| {
                labels[j].push(word.clone());
                next
            });
            codes.push(code);
        }
    }

    Ok(CategoricalCodes {
        codes: Tensor::from_vec(codes, (rows.len(), k), device)?,
        n_cats_per_cov: labels.iter().map(|l| l.len()).collect(),
        labels,
    })
}

/// Write a 1d or 2d tensor as tab-separated values
pub fn write_tensor(tensor: &Tensor, output_file: &str) -> anyhow::Result<()> {
    let tensor = tensor.to_dtype(candle_core::DType::F32)?;
    let rows = match tensor.rank() {
        1 => vec![tensor.to_vec1::<f32>()?],
        2 => tensor.to_vec2::<f32>()?,
        r => return Err(anyhow!("can't write a rank-{} tensor", r)),
    };

    mkdir(output_file)?;
    let mut buf = open_buf_writer(output_file)?;
    for row in rows {
        let words: Vec<String> = row.iter().map(|x| x.to_string()).collect();
        writeln!(buf, "{}", words.join("\t"))?;
    }
    buf.flush()?;
    Ok(())
}

/// Write one label per line
pub fn write_labels(labels: &[Box<str>], output_file: &str) -> anyhow::Result<()> {
    mkdir(output_file)?;
    let mut buf = open_buf_writer(output_file)?;
    for l in labels {
        writeln!(buf, "{}", l)?;
    }
    buf.flush()?;
    Ok(())
}
