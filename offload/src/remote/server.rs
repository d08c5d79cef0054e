use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, VecDeque},
    io::{self, BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, warn};

struct Work {
    queue: VecDeque<u32>,
    reported: BTreeSet<u32>,
    total: usize,
}

/// Hands sub-task coordinates to node masters on request, first-come.
/// There is no work stealing: a coordinate handed out and never
/// reported back simply stays unreported and shows up as a shortfall
/// when the task master finalizes.
///
/// Line protocol, one request per line:
/// `NEXT` -> `<index>` or `NONE`; `DONE <index>` -> `OK`.
pub struct DistributionServer {
    addr: SocketAddr,
    work: Arc<Mutex<Work>>,
    shutdown: Arc<AtomicBool>,
    accept_handle: Option<thread::JoinHandle<()>>,
}

impl DistributionServer {
    pub fn start(indices: Vec<u32>) -> io::Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0")?;
        let addr = listener.local_addr()?;

        let work = Arc::new(Mutex::new(Work {
            total: indices.len(),
            queue: indices.into(),
            reported: BTreeSet::new(),
        }));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_work = Arc::clone(&work);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_handle = thread::Builder::new()
            .name("dist-server".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if accept_shutdown.load(Ordering::SeqCst) {
                        break;
                    }

                    match stream {
                        Ok(stream) => {
                            let work = Arc::clone(&accept_work);
                            thread::spawn(move || {
                                if let Err(error) = serve_connection(stream, work) {
                                    debug!(error = ?error, "Distribution connection closed");
                                }
                            });
                        }
                        Err(error) => warn!(error = ?error, "Failed to accept connection"),
                    }
                }
            })?;

        debug!(addr = %addr, "Distribution server listening");

        Ok(Self {
            addr,
            work,
            shutdown,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// True once every coordinate has been reported back.
    pub fn all_reported(&self) -> bool {
        let work = self.work.lock();
        work.reported.len() == work.total
    }

    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // unblock the accept loop with a throwaway connection
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DistributionServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_connection(stream: TcpStream, work: Arc<Mutex<Work>>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);

    for line in reader.lines() {
        let line = line?;
        let request = line.trim();

        if request == "NEXT" {
            let next = work.lock().queue.pop_front();
            match next {
                Some(index) => writeln!(writer, "{index}")?,
                None => writeln!(writer, "NONE")?,
            }
        } else if let Some(index) = request.strip_prefix("DONE ") {
            match index.parse::<u32>() {
                Ok(index) => {
                    work.lock().reported.insert(index);
                    writeln!(writer, "OK")?;
                }
                Err(_) => {
                    warn!(request = request, "Malformed completion report");
                    writeln!(writer, "ERR")?;
                }
            }
        } else if !request.is_empty() {
            warn!(request = request, "Unknown distribution request");
            writeln!(writer, "ERR")?;
        }
    }

    Ok(())
}

/// Client side of the distribution protocol; one per worker thread.
pub struct DistributionClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl DistributionClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let writer = stream.try_clone()?;

        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Request the next sub-task coordinate; `None` means the queue is
    /// drained and the worker should exit.
    pub fn next(&mut self) -> io::Result<Option<u32>> {
        writeln!(self.writer, "NEXT")?;
        let response = self.read_line()?;

        if response == "NONE" {
            return Ok(None);
        }

        response
            .parse::<u32>()
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, response))
    }

    /// Report a coordinate as handled, success and failure alike.
    pub fn done(&mut self, index: u32) -> io::Result<()> {
        writeln!(self.writer, "DONE {index}")?;
        let response = self.read_line()?;

        if response == "OK" {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidData, response))
        }
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "distribution server closed the connection",
            ));
        }

        Ok(line.trim().to_string())
    }
}
