use std::{
    future::Future, io, net, sync::mpsc as std_mpsc, thread, time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    runtime,
    sync::oneshot,
};

pub struct Server {
    addr: net::SocketAddr,
    panic_rx: std_mpsc::Receiver<()>,
    events_rx: std_mpsc::Receiver<Event>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Accepted,
    ConnectionClosed,
}

impl Server {
    pub fn addr(&self) -> net::SocketAddr {
        self.addr
    }

    #[allow(unused)]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    #[allow(unused)]
    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    #[allow(unused)]
    pub fn events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Connections accepted since the last call to `events` or `accepted`.
    #[allow(unused)]
    pub fn accepted(&mut self) -> usize {
        self.events()
            .into_iter()
            .filter(|event| *event == Event::Accepted)
            .count()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if !::std::thread::panicking() {
            self.panic_rx
                .recv_timeout(Duration::from_secs(3))
                .expect("test server should not panic");
        }
    }
}

/// Serve every accepted connection with `func`, which also receives the
/// zero-based index of the connection.
pub fn tcp<F, Fut>(func: F) -> Server
where
    F: Fn(TcpStream, usize) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // Spawn new runtime in thread to prevent reactor execution context conflict
    let test_name = thread::current().name().unwrap_or("<unknown>").to_string();
    thread::spawn(move || {
        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("new rt");
        let listener = rt.block_on(async move {
            tokio::net::TcpListener::bind(&std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap()
        });
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let (panic_tx, panic_rx) = std_mpsc::channel();
        let (events_tx, events_rx) = std_mpsc::channel();
        let tname = format!("test({test_name})-support-server");
        thread::Builder::new()
            .name(tname)
            .spawn(move || {
                rt.block_on(async move {
                    let mut index = 0;
                    loop {
                        tokio::select! {
                            _ = &mut shutdown_rx => {
                                break;
                            }
                            accepted = listener.accept() => {
                                let (io, _) = accepted.expect("accepted");
                                let _ = events_tx.send(Event::Accepted);
                                let func = func.clone();
                                let events_tx = events_tx.clone();
                                let n = index;
                                index += 1;
                                tokio::spawn(async move {
                                    func(io, n).await;
                                    let _ = events_tx.send(Event::ConnectionClosed);
                                });
                            }
                        }
                    }
                    let _ = panic_tx.send(());
                });
            })
            .expect("thread spawn");
        Server {
            addr,
            panic_rx,
            events_rx,
            shutdown_tx: Some(shutdown_tx),
        }
    })
    .join()
    .unwrap()
}

/// Answer every request on every connection with `handler`, keeping
/// connections alive until the client hangs up.
#[allow(unused)]
pub fn http<F>(handler: F) -> Server
where
    F: Fn(&Request) -> Vec<u8> + Clone + Send + Sync + 'static,
{
    tcp(move |mut io, _| {
        let handler = handler.clone();
        async move {
            while let Ok(Some(req)) = read_request(&mut io).await {
                let response = handler(&req);
                if io.write_all(&response).await.is_err() {
                    break;
                }
            }
        }
    })
}

/// A request as seen by the test server.
#[derive(Debug)]
pub struct Request {
    pub head: String,
    pub body: Vec<u8>,
}

impl Request {
    #[allow(unused)]
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    #[allow(unused)]
    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.head, name)
    }
}

/// Case-insensitive lookup of the first `name` header in a message head.
pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// A complete response with a `Content-Length` body.
#[allow(unused)]
pub fn response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\ncontent-length: {}\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Read one message head, byte by byte so nothing after it is consumed.
/// Returns an empty string if the client hung up first.
pub async fn read_head(io: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if io.read(&mut byte).await? == 0 {
            return Ok(String::new());
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn read_line(io: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0; 1];
    while !buf.ends_with(b"\r\n") {
        if io.read(&mut byte).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.push(byte[0]);
    }
    buf.truncate(buf.len() - 2);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read a full request, decoding a `Content-Length` or chunked body.
pub async fn read_request(io: &mut TcpStream) -> io::Result<Option<Request>> {
    let head = read_head(io).await?;
    if head.is_empty() {
        return Ok(None);
    }

    let mut body = Vec::new();
    if header(&head, "transfer-encoding").map_or(false, |te| te.contains("chunked")) {
        loop {
            let line = read_line(io).await?;
            let size = usize::from_str_radix(line.split(';').next().unwrap_or("").trim(), 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if size == 0 {
                while !read_line(io).await?.is_empty() {}
                break;
            }
            let mut chunk = vec![0; size + 2];
            io.read_exact(&mut chunk).await?;
            body.extend_from_slice(&chunk[..size]);
        }
    } else if let Some(len) = header(&head, "content-length") {
        let len: usize = len
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        body.resize(len, 0);
        io.read_exact(&mut body).await?;
    }
    Ok(Some(Request { head, body }))
}

/// Complete the server side of a WebSocket handshake, optionally selecting
/// `protocol`. Returns the request head.
#[allow(unused)]
pub async fn accept_websocket(io: &mut TcpStream, protocol: Option<&str>) -> io::Result<String> {
    let head = read_head(io).await?;
    let key = header(&head, "sec-websocket-key").unwrap_or_default();
    let accept = tungstenite::handshake::derive_accept_key(key.as_bytes());
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         connection: upgrade\r\n\
         upgrade: websocket\r\n\
         sec-websocket-accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        response.push_str(&format!("sec-websocket-protocol: {protocol}\r\n"));
    }
    response.push_str("\r\n");
    io.write_all(response.as_bytes()).await?;
    Ok(head)
}

pub const OP_CONTINUE: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// An unmasked server frame.
#[allow(unused)]
pub fn frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![if fin { 0x80 } else { 0 } | opcode];
    match payload.len() {
        len if len < 126 => out.push(len as u8),
        len if len <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

#[allow(unused)]
pub async fn write_frame(io: &mut TcpStream, opcode: u8, payload: &[u8]) -> io::Result<()> {
    io.write_all(&frame(opcode, true, payload)).await
}

/// A client frame, unmasked.
#[derive(Debug)]
pub struct ClientFrame {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl ClientFrame {
    #[allow(unused)]
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == OP_CLOSE && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }
}

/// Read one client frame. `None` if the client hung up.
#[allow(unused)]
pub async fn read_frame(io: &mut TcpStream) -> io::Result<Option<ClientFrame>> {
    let mut head = [0; 2];
    match io.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;
    let len = match head[1] & 0x7F {
        126 => {
            let mut ext = [0; 2];
            io.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0; 8];
            io.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut mask = [0; 4];
    if masked {
        io.read_exact(&mut mask).await?;
    }
    let mut payload = vec![0; len];
    io.read_exact(&mut payload).await?;
    if masked {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }
    Ok(Some(ClientFrame {
        fin,
        opcode,
        masked,
        payload,
    }))
}
