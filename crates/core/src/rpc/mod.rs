// clueweb22 is a toolkit for scanning and extracting the ClueWeb22 web corpus.
// Copyright (C) 2024 clueweb22 authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Request/reply messaging between the scan tools: bincode bodies behind a
//! fixed-size length header, one reply per request.

pub mod retry;

use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

const MAX_BODY_SIZE_BYTES: u64 = 1024 * 1024 * 1024; // 1GB

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Got an IO error")]
    IO(#[from] std::io::Error),

    #[error("Failed to connect to peer: connection timeout")]
    ConnectionTimeout,

    #[error("Failed to get response for request: connection timeout")]
    RequestTimeout,

    #[error("The body size ({body_size}) is larger than the maximum allowed ({max_size})")]
    BodyTooLarge { body_size: u64, max_size: u64 },

    #[error("Failed to encode message")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode message")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Messages understood by the coordinator and supervisor endpoints. Every
/// request is answered with exactly one [`Reply::Ack`]; requests that make no
/// sense for the endpoint that received them are logged and acked with an
/// empty payload.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum Request {
    /// Lease up to `count` container files for `job`.
    NewJob { job: String, count: usize },

    /// Report the outcome of a previously leased batch.
    Finished { job: String, count: usize, ok: bool },

    /// Ask the coordinator to leave its scheduler loop.
    Exit,

    /// Return every row leased by `job` to the unscanned state.
    ResetJob { job: String },

    /// Stop handing new files to the given supervisor worker.
    PauseWorker { worker: usize },

    /// Wake the given supervisor worker up again.
    ResumeWorker { worker: usize },
}

#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub enum Reply {
    Ack(Option<Vec<String>>),
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct Header {
    body_size: u64,
}

pub struct Connection {
    stream: TcpStream,
}

impl Connection {
    pub async fn create(server: impl ToSocketAddrs) -> Result<Self> {
        Self::create_with_timeout(server, Duration::from_secs(30)).await
    }

    pub async fn create_with_timeout(
        server: impl ToSocketAddrs,
        timeout: Duration,
    ) -> Result<Self> {
        match tokio::time::timeout(timeout, TcpStream::connect(server)).await {
            Ok(stream) => {
                let stream = stream?;
                stream.set_nodelay(true)?;

                Ok(Connection { stream })
            }
            Err(_) => Err(Error::ConnectionTimeout),
        }
    }

    pub async fn create_with_timeout_retry(
        server: impl ToSocketAddrs + Clone,
        timeout: Duration,
        retry: impl Iterator<Item = Duration>,
    ) -> Result<Self> {
        let mut conn = Connection::create_with_timeout(server.clone(), timeout).await;
        let mut retry = retry;

        loop {
            match conn {
                Ok(conn) => return Ok(conn),
                Err(_) => {
                    if let Some(backoff) = retry.next() {
                        tokio::time::sleep(backoff).await;
                        conn = Connection::create_with_timeout(server.clone(), timeout).await;
                    } else {
                        return Err(Error::ConnectionTimeout);
                    }
                }
            }
        }
    }

    async fn send_without_timeout(&mut self, request: &Request) -> Result<Reply> {
        let bytes = bincode::encode_to_vec(request, bincode::config::standard())?;

        let header = Header {
            body_size: bytes.len() as u64,
        };

        self.stream.write_all(bytemuck::bytes_of(&header)).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;

        let mut header_buf = vec![0; std::mem::size_of::<Header>()];
        self.stream.read_exact(&mut header_buf).await?;
        let header: Header = *bytemuck::from_bytes(&header_buf);

        if header.body_size > MAX_BODY_SIZE_BYTES {
            return Err(Error::BodyTooLarge {
                body_size: header.body_size,
                max_size: MAX_BODY_SIZE_BYTES,
            });
        }

        let mut buf = vec![0; header.body_size as usize];
        self.stream.read_exact(&mut buf).await?;

        let (reply, _) = bincode::decode_from_slice(&buf, bincode::config::standard())?;

        Ok(reply)
    }

    pub async fn send(&mut self, request: &Request) -> Result<Reply> {
        self.send_with_timeout(request, Duration::from_secs(90))
            .await
    }

    pub async fn send_with_timeout(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Reply> {
        match tokio::time::timeout(timeout, self.send_without_timeout(request)).await {
            Ok(res) => res,
            Err(_) => {
                self.stream.shutdown().await?;
                Err(Error::RequestTimeout)
            }
        }
    }
}

/// Open a fresh connection, send one request and return the reply.
pub async fn send_once(server: impl ToSocketAddrs, request: &Request) -> Result<Reply> {
    let mut conn = Connection::create(server).await?;
    conn.send(request).await
}

pub struct Server {
    listener: TcpListener,
}

impl Server {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server { listener })
    }

    pub async fn accept(&self) -> Result<ServerConnection> {
        let (stream, client) = self.listener.accept().await?;
        tracing::debug!(?client, "accepted connection");

        Ok(ServerConnection { stream })
    }
}

pub struct ServerConnection {
    stream: TcpStream,
}

impl ServerConnection {
    pub async fn request(&mut self) -> Result<IncomingRequest<'_>> {
        let mut header_buf = vec![0; std::mem::size_of::<Header>()];
        self.stream.read_exact(&mut header_buf).await?;
        let header: Header = *bytemuck::from_bytes(&header_buf);

        if header.body_size > MAX_BODY_SIZE_BYTES {
            return Err(Error::BodyTooLarge {
                body_size: header.body_size,
                max_size: MAX_BODY_SIZE_BYTES,
            });
        }

        let mut buf = vec![0; header.body_size as usize];
        self.stream.read_exact(&mut buf).await?;

        let (body, _) = bincode::decode_from_slice(&buf, bincode::config::standard())?;

        Ok(IncomingRequest { conn: self, body })
    }
}

pub struct IncomingRequest<'a> {
    conn: &'a mut ServerConnection,
    body: Request,
}

impl IncomingRequest<'_> {
    pub fn body(&self) -> &Request {
        &self.body
    }

    async fn respond_without_timeout(self, reply: Reply) -> Result<()> {
        let bytes = bincode::encode_to_vec(&reply, bincode::config::standard())?;
        let header = Header {
            body_size: bytes.len() as u64,
        };

        self.conn
            .stream
            .write_all(bytemuck::bytes_of(&header))
            .await?;
        self.conn.stream.write_all(&bytes).await?;
        self.conn.stream.flush().await?;

        Ok(())
    }

    pub async fn respond(self, reply: Reply) -> Result<()> {
        tokio::time::timeout(
            Duration::from_secs(90),
            self.respond_without_timeout(reply),
        )
        .await
        .map_err(|_| Error::RequestTimeout)?
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::free_socket_addr;

    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn request_reply() {
        runtime().block_on(async {
            let addr = free_socket_addr();
            let server = Server::bind(addr).await.unwrap();

            let svr_task = tokio::spawn(async move {
                let mut conn = server.accept().await.unwrap();
                let req = conn.request().await.unwrap();
                assert_eq!(
                    req.body(),
                    &Request::NewJob {
                        job: "job-a".to_string(),
                        count: 3
                    }
                );
                req.respond(Reply::Ack(Some(vec!["a".to_string(), "b".to_string()])))
                    .await
                    .unwrap();
            });

            let mut conn = Connection::create(addr).await.unwrap();
            let reply = conn
                .send(&Request::NewJob {
                    job: "job-a".to_string(),
                    count: 3,
                })
                .await
                .unwrap();

            assert_eq!(
                reply,
                Reply::Ack(Some(vec!["a".to_string(), "b".to_string()]))
            );

            svr_task.await.unwrap();
        });
    }

    #[test]
    fn multiple_requests_one_server() {
        runtime().block_on(async {
            let addr = free_socket_addr();
            let server = Server::bind(addr).await.unwrap();

            let svr_task = tokio::spawn(async move {
                for _ in 0..2 {
                    let mut conn = server.accept().await.unwrap();
                    let req = conn.request().await.unwrap();
                    let reply = match req.body() {
                        Request::Exit => Reply::Ack(None),
                        _ => Reply::Ack(Some(Vec::new())),
                    };
                    req.respond(reply).await.unwrap();
                }
            });

            let reply = send_once(addr, &Request::Exit).await.unwrap();
            assert_eq!(reply, Reply::Ack(None));

            let reply = send_once(
                addr,
                &Request::ResetJob {
                    job: "j".to_string(),
                },
            )
            .await
            .unwrap();
            assert_eq!(reply, Reply::Ack(Some(Vec::new())));

            svr_task.await.unwrap();
        });
    }

    #[test]
    fn connect_to_dead_peer_fails() {
        runtime().block_on(async {
            let addr = free_socket_addr();
            let res = Connection::create_with_timeout(addr, Duration::from_millis(500)).await;
            assert!(res.is_err());
        });
    }

    proptest! {
        #[test]
        fn message_encoding_roundtrips(
            job in "[a-z0-9-]{1,16}",
            count in 0usize..10_000,
            ok in any::<bool>(),
            worker in 0usize..64,
        ) {
            let messages = [
                Request::NewJob { job: job.clone(), count },
                Request::Finished { job: job.clone(), count, ok },
                Request::Exit,
                Request::ResetJob { job },
                Request::PauseWorker { worker },
                Request::ResumeWorker { worker },
            ];

            for message in messages {
                let bytes =
                    bincode::encode_to_vec(&message, bincode::config::standard()).unwrap();
                let (decoded, read) = bincode::decode_from_slice::<Request, _>(
                    &bytes,
                    bincode::config::standard(),
                )
                .unwrap();

                prop_assert_eq!(read, bytes.len());
                prop_assert_eq!(decoded, message);
            }
        }
    }
}
