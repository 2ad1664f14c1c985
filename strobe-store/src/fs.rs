// strobe - bitdrift's statsd aggregation and time series engine
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./fs_test.rs"]
mod fs_test;

use crate::{Datastore, Error, Record};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

const PARTITIONS: usize = 4;
const ISIZE: i64 = 16;
const DSIZE: i64 = 8;
const TAIL_FILE: &str = "tail_data";

// Largest stream name accepted from a tail checkpoint. Anything bigger means the file is corrupt.
const MAX_CHECKPOINT_NAME: u64 = 1 << 16;

fn invalid_data(msg: &str) -> Error {
  Error::Io(std::io::Error::new(ErrorKind::InvalidData, msg.to_string()))
}

fn read_u64(rd: &mut impl Read) -> Result<u64, Error> {
  let mut buf = [0_u8; 8];
  rd.read_exact(&mut buf)?;
  Ok(u64::from_le_bytes(buf))
}

fn read_i64(rd: &mut impl Read) -> Result<i64, Error> {
  let mut buf = [0_u8; 8];
  rd.read_exact(&mut buf)?;
  Ok(i64::from_le_bytes(buf))
}

fn read_f64(rd: &mut impl Read) -> Result<f64, Error> {
  let mut buf = [0_u8; 8];
  rd.read_exact(&mut buf)?;
  Ok(f64::from_le_bytes(buf))
}

//
// StreamState
//

// Mutable state of one stream. `tail` holds records not yet written to disk. File handles are
// only held while a writer pass or a snapshot is in flight. `valid` is cleared on write errors
// so the next open re-stats the file sizes instead of trusting the cached ones.
struct StreamState {
  tail: Vec<Record>,
  dat: Option<File>,
  idx: Option<File>,
  valid: bool,
  last_wr: i64,
  dsize: i64,
  isize: i64,
}

struct Stream {
  name: String,
  state: Mutex<StreamState>,
}

//
// Partition
//

// Streams are sharded over a fixed number of partitions, each with its own writer thread. Only
// streams with a pending tail (or a pending read) are present in the map; the writer drops a
// stream once its tail drains and it is recreated lazily on the next use.
struct PartitionState {
  running: bool,
  streams: HashMap<String, Arc<Stream>>,
  queue: Vec<Arc<Stream>>,
}

struct Partition {
  state: Mutex<PartitionState>,
  cond: Condvar,
}

struct Global {
  running: bool,
  writers: Vec<JoinHandle<()>>,
}

//
// Snapshot
//

// A point-in-time view of one stream: a copy of the tail plus the stream's open file handles,
// stolen so that concurrent writer passes reopen their own. Reads served from a snapshot never
// block the writer for the duration of the I/O; appends that land after the snapshot is taken
// are not visible.
struct Snapshot {
  tail: Vec<Record>,
  dat: File,
  idx: File,
  last_wr: i64,
  dsize: i64,
  isize: i64,
}

impl Snapshot {
  fn read_idx_entry(&self, n: i64) -> Result<(i64, i64), Error> {
    let mut buf = [0_u8; ISIZE as usize];
    (&self.idx).seek(SeekFrom::Start((n * ISIZE) as u64))?;
    (&self.idx).read_exact(&mut buf)?;
    let ts = i64::from_le_bytes(buf[0 .. 8].try_into().unwrap());
    let pos = i64::from_le_bytes(buf[8 .. 16].try_into().unwrap());
    if ts % 60 != 0 || pos % DSIZE != 0 {
      return Err(Error::InvalidIndexData(format!("entry {n}")));
    }
    Ok((ts, pos))
  }

  fn read_values(&self, pos: i64, count: i64) -> Result<Vec<f64>, Error> {
    let mut buf = vec![0_u8; (count * DSIZE) as usize];
    (&self.dat).seek(SeekFrom::Start(pos as u64))?;
    (&self.dat).read_exact(&mut buf)?;
    Ok(
      buf
        .chunks_exact(DSIZE as usize)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect(),
    )
  }

  // The last tail record with ts <= the bound, walking the tail the same way the writer will:
  // records that are not minute aligned or do not advance past the previously written timestamp
  // are going to be rejected, so they do not count here either.
  fn find_tail(&self, ts: i64) -> Option<Record> {
    let mut last = self.last_wr;
    let mut found = None;
    for r in &self.tail {
      if r.ts % 60 != 0 || last >= r.ts {
        continue;
      }
      if r.ts <= ts {
        found = Some(*r);
      } else {
        break;
      }
      last = r.ts;
    }
    found
  }

  // Index of the last index entry with a timestamp <= ts, if any.
  fn find_idx(&self, ts: i64) -> Result<Option<i64>, Error> {
    let n = self.isize / ISIZE;
    if n == 0 {
      return Ok(None);
    }
    let (first, _) = self.read_idx_entry(0)?;
    if first > ts {
      return Ok(None);
    }
    let (mut i, mut j) = (0, n - 1);
    while i < j {
      let k = (i + j + 1) / 2;
      let (t, _) = self.read_idx_entry(k)?;
      if t <= ts {
        i = k;
      } else {
        j = k - 1;
      }
    }
    Ok(Some(i))
  }
}

//
// FsDatastore
//

// Append-only per-stream storage under a single directory. Each stream is a pair of files:
// `<name>.dat` holds one little-endian f64 per minute, contiguous in time from the stream's
// first recorded minute; `<name>.idx` holds (i64 ts, i64 pos) pairs marking the positions where
// the minute contiguity was broken. Unwritten tails are checkpointed to `tail_data` on close.
pub struct FsDatastore {
  dir: PathBuf,
  global: Mutex<Global>,
  partitions: [Partition; PARTITIONS],
}

impl FsDatastore {
  #[must_use]
  pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
    Arc::new(Self {
      dir: dir.into(),
      global: Mutex::new(Global {
        running: false,
        writers: Vec::new(),
      }),
      partitions: std::array::from_fn(|_| Partition {
        state: Mutex::new(PartitionState {
          running: false,
          streams: HashMap::new(),
          queue: Vec::new(),
        }),
        cond: Condvar::new(),
      }),
    })
  }

  pub fn open(self: &Arc<Self>) -> Result<(), Error> {
    let mut global = self.global.lock();
    if global.running {
      return Err(Error::AlreadyRunning);
    }
    let meta = fs::metadata(&self.dir)?;
    if !meta.is_dir() {
      return Err(Error::NotADirectory(self.dir.clone()));
    }

    {
      let mut parts: Vec<MutexGuard<'_, PartitionState>> =
        self.partitions.iter().map(|p| p.state.lock()).collect();
      for pg in &mut parts {
        pg.running = true;
        pg.streams.clear();
        pg.queue.clear();
      }
      self.load_tails(&mut parts);
    }

    for p in 0 .. PARTITIONS {
      let ds = Arc::clone(self);
      global.writers.push(
        std::thread::Builder::new()
          .name(format!("store-writer-{p}"))
          .spawn(move || ds.write_loop(p))?,
      );
    }
    global.running = true;
    Ok(())
  }

  // Checkpoints every in-memory tail to `tail_data`, stops the writer threads, and drops all
  // stream state. The datastore can be reopened afterwards.
  pub fn close(&self) -> Result<(), Error> {
    let mut global = self.global.lock();
    if !global.running {
      return Err(Error::NotRunning);
    }

    {
      let mut parts: Vec<MutexGuard<'_, PartitionState>> =
        self.partitions.iter().map(|p| p.state.lock()).collect();
      if let Err(e) = self.save_tails(&parts) {
        log::warn!("tail checkpoint failed: {e}");
        let _ = fs::remove_file(self.dir.join(TAIL_FILE));
      }
      for (p, pg) in parts.iter_mut().enumerate() {
        pg.running = false;
        pg.streams.clear();
        pg.queue.clear();
        self.partitions[p].cond.notify_one();
      }
    }

    for handle in global.writers.drain(..) {
      if handle.join().is_err() {
        log::warn!("store writer thread panicked");
      }
    }
    global.running = false;
    Ok(())
  }

  fn create_stream(
    &self,
    p: usize,
    pg: &mut PartitionState,
    name: String,
    tail: Vec<Record>,
  ) -> Arc<Stream> {
    let st = Arc::new(Stream {
      name: name.clone(),
      state: Mutex::new(StreamState {
        tail,
        dat: None,
        idx: None,
        valid: false,
        last_wr: 0,
        dsize: 0,
        isize: 0,
      }),
    });
    pg.streams.insert(name, Arc::clone(&st));
    pg.queue.push(Arc::clone(&st));
    if pg.queue.len() == 1 {
      self.partitions[p].cond.notify_one();
    }
    st
  }

  fn make_snapshot(&self, name: &str) -> Result<Snapshot, Error> {
    let p = Self::partition(name);
    let mut pg = self.partitions[p].state.lock();
    if !pg.running {
      return Err(Error::NotRunning);
    }
    let st = match pg.streams.get(name) {
      Some(st) => Arc::clone(st),
      None => self.create_stream(p, &mut pg, name.to_string(), Vec::new()),
    };
    let mut sg = st.state.lock();
    drop(pg);

    open_files(&self.dir, &st.name, &mut sg)?;
    Ok(Snapshot {
      tail: sg.tail.clone(),
      dat: sg.dat.take().unwrap(),
      idx: sg.idx.take().unwrap(),
      last_wr: sg.last_wr,
      dsize: sg.dsize,
      isize: sg.isize,
    })
  }

  fn write_loop(&self, p: usize) {
    let part = &self.partitions[p];
    let mut n = usize::MAX;
    loop {
      let mut pg = part.state.lock();
      while pg.queue.is_empty() && pg.running {
        part.cond.wait(&mut pg);
      }
      if !pg.running {
        return;
      }

      n = n.wrapping_add(1);
      if n >= pg.queue.len() {
        n = 0;
      }
      let st = Arc::clone(&pg.queue[n]);
      let mut sg = st.state.lock();
      if sg.tail.is_empty() {
        // Drained: drop the stream. It is reloaded lazily on the next insert or read.
        pg.queue.swap_remove(n);
        pg.streams.remove(&st.name);
        if pg.queue.capacity() > 3 * pg.queue.len() {
          let new_cap = 2 * pg.queue.len();
          pg.queue.shrink_to(new_cap);
        }
        log::debug!("store: dropped drained stream {}", st.name);
      } else {
        drop(pg);
        if let Err(e) = write_tail(&self.dir, &st.name, &mut sg) {
          sg.valid = false;
          log::warn!("store: write {} failed: {e}", st.name);
        }
        let len = sg.tail.len();
        if sg.tail.capacity() > 3 * len {
          sg.tail = Vec::with_capacity(2 * len);
        } else {
          sg.tail.clear();
        }
      }
    }
  }

  fn save_tails(&self, parts: &[MutexGuard<'_, PartitionState>]) -> Result<(), Error> {
    let file = File::create(self.dir.join(TAIL_FILE))?;
    let mut wr = BufWriter::new(file);

    let ntails: u64 = parts.iter().map(|pg| pg.streams.len() as u64).sum();
    wr.write_all(&ntails.to_le_bytes())?;
    for pg in parts {
      for (name, st) in &pg.streams {
        let sg = st.state.lock();
        wr.write_all(&(name.len() as u64).to_le_bytes())?;
        wr.write_all(&(sg.tail.len() as u64).to_le_bytes())?;
        wr.write_all(name.as_bytes())?;
        for r in &sg.tail {
          wr.write_all(&r.ts.to_le_bytes())?;
          wr.write_all(&r.value.to_le_bytes())?;
        }
      }
    }
    wr.flush()?;
    wr.get_ref().sync_all()?;
    Ok(())
  }

  // A checkpoint that fails to load is discarded and the datastore starts empty.
  fn load_tails(&self, parts: &mut [MutexGuard<'_, PartitionState>]) {
    let path = self.dir.join(TAIL_FILE);
    let file = match File::open(&path) {
      Err(e) if e.kind() == ErrorKind::NotFound => return,
      Err(e) => {
        log::warn!("discarding tail checkpoint: {e}");
        let _ = fs::remove_file(&path);
        return;
      },
      Ok(f) => f,
    };
    match parse_tails(&mut BufReader::new(file)) {
      Ok(tails) => {
        for (name, tail) in tails {
          let p = Self::partition(&name);
          self.create_stream(p, &mut parts[p], name, tail);
        }
      },
      Err(e) => {
        log::warn!("discarding tail checkpoint: {e}");
        let _ = fs::remove_file(&path);
      },
    }
  }

  // CRC-32C-style bit fold over the name, reduced to a partition number.
  fn partition(name: &str) -> usize {
    let mut x: u64 = 0;
    for b in name.bytes() {
      for i in (0 .. 16).rev() {
        x <<= 1;
        x ^= 0x1edc_6f41_u64.wrapping_mul((x >> 32) ^ ((u64::from(b) >> i) & 1));
      }
    }
    ((x & 0xffff) % PARTITIONS as u64) as usize
  }
}

impl Datastore for FsDatastore {
  fn insert(&self, name: &str, record: Record) -> Result<(), Error> {
    let p = Self::partition(name);
    let mut pg = self.partitions[p].state.lock();
    if !pg.running {
      return Err(Error::NotRunning);
    }
    let st = match pg.streams.get(name) {
      Some(st) => Arc::clone(st),
      None => self.create_stream(p, &mut pg, name.to_string(), Vec::new()),
    };
    let mut sg = st.state.lock();
    drop(pg);
    sg.tail.push(record);
    Ok(())
  }

  fn query(&self, name: &str, from: i64, until: i64) -> Result<Vec<Record>, Error> {
    let snap = self.make_snapshot(name)?;
    let mut out = Vec::new();

    let n_idx = snap.isize / ISIZE;
    for k in 0 .. n_idx {
      let (t, pos) = snap.read_idx_entry(k)?;
      let end = if k == n_idx - 1 {
        snap.dsize
      } else {
        snap.read_idx_entry(k + 1)?.1
      };
      let count = (end - pos) / DSIZE;
      if count <= 0 {
        continue;
      }
      let seg_last = t + 60 * (count - 1);
      if seg_last <= from || t > until {
        continue;
      }
      let i0 = if t > from { 0 } else { (from - t) / 60 + 1 };
      let i1 = (count - 1).min((until - t) / 60);
      if i1 < i0 {
        continue;
      }
      let values = snap.read_values(pos + i0 * DSIZE, i1 - i0 + 1)?;
      for (i, value) in (i0 ..= i1).zip(values) {
        out.push(Record {
          ts: t + 60 * i,
          value,
        });
      }
    }

    // Tail records sort after everything on disk.
    let mut last = snap.last_wr;
    for r in &snap.tail {
      if r.ts % 60 != 0 || last >= r.ts {
        continue;
      }
      last = r.ts;
      if r.ts > until {
        break;
      }
      if r.ts > from {
        out.push(*r);
      }
    }
    Ok(out)
  }

  fn latest_before(&self, name: &str, ts: i64) -> Result<Record, Error> {
    let snap = self.make_snapshot(name)?;
    let ts = ts - ts.rem_euclid(60);

    if let Some(r) = snap.find_tail(ts) {
      return Ok(r);
    }

    let Some(n) = snap.find_idx(ts)? else {
      return Err(Error::NoData);
    };
    let (t, pos) = snap.read_idx_entry(n)?;
    let seg_end = if n == snap.isize / ISIZE - 1 {
      snap.dsize - DSIZE
    } else {
      snap.read_idx_entry(n + 1)?.1 - DSIZE
    };
    // Clamp to the requested minute when it falls inside the segment, otherwise the segment's
    // last record is the latest one before the gap (or end of file).
    let last_pos = seg_end.min(pos + DSIZE * ((ts - t) / 60));
    let value = snap.read_values(last_pos, 1)?[0];
    Ok(Record {
      ts: t + 60 * ((last_pos - pos) / DSIZE),
      value,
    })
  }
}

fn parse_tails(rd: &mut impl Read) -> Result<Vec<(String, Vec<Record>)>, Error> {
  let ntails = read_u64(rd)?;
  let mut out = Vec::new();
  for _ in 0 .. ntails {
    let lname = read_u64(rd)?;
    if lname > MAX_CHECKPOINT_NAME {
      return Err(invalid_data("stream name too long"));
    }
    let ltail = read_u64(rd)?;
    let mut name = vec![0_u8; lname as usize];
    rd.read_exact(&mut name)?;
    let name = String::from_utf8(name).map_err(|_| invalid_data("stream name not utf-8"))?;
    let mut tail = Vec::new();
    for _ in 0 .. ltail {
      tail.push(Record {
        ts: read_i64(rd)?,
        value: read_f64(rd)?,
      });
    }
    out.push((name, tail));
  }
  Ok(out)
}

fn stream_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
  (
    dir.join(format!("{name}.dat")),
    dir.join(format!("{name}.idx")),
  )
}

fn open_files(dir: &Path, name: &str, sg: &mut StreamState) -> Result<(), Error> {
  let (dat_path, idx_path) = stream_paths(dir, name);
  // Stream names may carry a path-shaped server prefix.
  if let Some(parent) = dat_path.parent() {
    fs::create_dir_all(parent)?;
  }
  let dat = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .open(&dat_path)?;
  let idx = OpenOptions::new()
    .read(true)
    .write(true)
    .create(true)
    .open(&idx_path)?;
  sg.dat = Some(dat);
  sg.idx = Some(idx);

  if !sg.valid {
    if let Err(e) = stat_files(name, sg) {
      close_files(sg);
      return Err(e);
    }
    sg.valid = true;
  }
  Ok(())
}

// Recover sizes and the last written timestamp from the files themselves.
fn stat_files(name: &str, sg: &mut StreamState) -> Result<(), Error> {
  let dsize = sg.dat.as_ref().unwrap().metadata()?.len() as i64;
  let isize = sg.idx.as_ref().unwrap().metadata()?.len() as i64;
  if isize % ISIZE != 0 || dsize % DSIZE != 0 {
    return Err(Error::InvalidFileSize(name.to_string()));
  }

  if isize == 0 {
    sg.last_wr = i64::MIN - (i64::MIN % 60);
  } else {
    let mut idx = sg.idx.as_ref().unwrap();
    let mut buf = [0_u8; ISIZE as usize];
    idx.seek(SeekFrom::Start((isize - ISIZE) as u64))?;
    idx.read_exact(&mut buf)?;
    let ts = i64::from_le_bytes(buf[0 .. 8].try_into().unwrap());
    let pos = i64::from_le_bytes(buf[8 .. 16].try_into().unwrap());
    sg.last_wr = ts + 60 * ((dsize - pos) / DSIZE - 1);
  }
  sg.dsize = dsize;
  sg.isize = isize;
  Ok(())
}

fn close_files(sg: &mut StreamState) {
  for file in [sg.dat.take(), sg.idx.take()].into_iter().flatten() {
    if let Err(e) = file.sync_all() {
      log::warn!("store: sync failed: {e}");
    }
  }
}

fn write_tail(dir: &Path, name: &str, sg: &mut StreamState) -> Result<(), Error> {
  open_files(dir, name, sg)?;
  let result = append_tail(sg);
  close_files(sg);
  result
}

fn append_tail(sg: &mut StreamState) -> Result<(), Error> {
  let mut dbuf = Vec::with_capacity(sg.tail.len() * DSIZE as usize);
  let mut ibuf = Vec::new();
  let (mut dsize, mut isize, mut last_wr) = (sg.dsize, sg.isize, sg.last_wr);

  for r in &sg.tail {
    if r.ts % 60 != 0 {
      log::warn!("store: dropping record with timestamp not divisible by 60");
      continue;
    }
    if last_wr >= r.ts {
      log::warn!("store: dropping record with timestamp in the past");
      continue;
    }

    dbuf.extend_from_slice(&r.value.to_le_bytes());
    dsize += DSIZE;
    last_wr += 60;

    if r.ts > last_wr {
      // Contiguity broken: a new index entry marks where this gap starts.
      ibuf.extend_from_slice(&r.ts.to_le_bytes());
      ibuf.extend_from_slice(&(dsize - DSIZE).to_le_bytes());
      isize += ISIZE;
      last_wr = r.ts;
    }
  }

  let mut dat = sg.dat.as_ref().unwrap();
  let mut idx = sg.idx.as_ref().unwrap();
  dat.seek(SeekFrom::End(0))?;
  idx.seek(SeekFrom::End(0))?;
  dat.write_all(&dbuf)?;
  idx.write_all(&ibuf)?;

  sg.dsize = dsize;
  sg.isize = isize;
  sg.last_wr = last_wr;
  Ok(())
}
