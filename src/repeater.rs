// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Outbound (reverse/repeater) connection dialing.
//!
//! In a normal session the viewer dials the server. A reverse connection
//! inverts that: the server dials a listening viewer and then runs the
//! usual server-initiated handshake as if the viewer had connected in.
//! A repeater sits between many servers and many viewers and matches them
//! by an ASCII id string; dialing through one requires writing that id,
//! NUL-padded to 250 bytes, before the handshake begins.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Length of the repeater identifier field, fixed by the UltraVNC
/// repeater protocol.
const REPEATER_ID_LEN: usize = 250;

/// Dials a listening viewer directly; the returned stream is ready for
/// the standard server-initiated handshake (`VncClient::new`).
pub async fn dial_reverse(host: &str, port: u16) -> std::io::Result<TcpStream> {
    TcpStream::connect((host, port)).await
}

/// Dials a repeater, writes the NUL-padded 250-byte ASCII id string, then
/// returns the stream ready for the standard handshake.
///
/// # Errors
///
/// Returns an I/O error if the connect or the id-string write fails.
pub async fn dial_repeater(host: &str, port: u16, id: &str) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let mut id_field = [0u8; REPEATER_ID_LEN];
    let id_bytes = id.as_bytes();
    let n = id_bytes.len().min(REPEATER_ID_LEN);
    id_field[..n].copy_from_slice(&id_bytes[..n]);

    stream.write_all(&id_field).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn repeater_id_is_nul_padded_to_250_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; REPEATER_ID_LEN];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        dial_repeater(&addr.ip().to_string(), addr.port(), "ID:1234")
            .await
            .unwrap();

        let received = server_task.await.unwrap();
        assert_eq!(&received[..7], b"ID:1234");
        assert!(received[7..].iter().all(|&b| b == 0));
    }
}
