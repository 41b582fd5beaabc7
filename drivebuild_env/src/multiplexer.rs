//! Request/response exchange on top of the framed transport.
//!
//! A request is a sequence of frames on one socket:
//!
//! ```text
//! <action token> <Num item count> <item 1> ... <item n>
//! ```
//!
//! answered by exactly one reply frame. A count of `-1` encodes "no items"
//! so an empty count message is never mistaken for a missing one.

use crate::proto::{Num, Void};
use crate::transport::FramedSocket;
use crate::EnvError;
use async_trait::async_trait;
use prost::Message;
use tracing::{debug, warn};

/// Item count sent for a request without items.
pub const NO_ITEMS: i64 = -1;

/// Server-side callback invoked once per complete request.
///
/// Handlers turn every domain failure into a reply payload; nothing a
/// handler does can tear down the connection.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, action: &str, items: Vec<Vec<u8>>) -> Vec<u8>;
}

/// A complete request as read from a socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub action: String,
    pub items: Vec<Vec<u8>>,
}

/// Sends a request and blocks until its reply frame arrives.
///
/// The socket's request lock is held across the whole exchange so two
/// callers sharing a socket never receive each other's replies.
pub async fn send_request(
    socket: &FramedSocket,
    action: &str,
    items: &[Vec<u8>],
) -> Result<Vec<u8>, EnvError> {
    let _exchange = socket.lock_requests().await;
    debug!("-> {} {} ({} items)", socket.peer(), action, items.len());

    socket.send(action.as_bytes()).await?;
    let count = if items.is_empty() {
        NO_ITEMS
    } else {
        items.len() as i64
    };
    socket.send(&Num::new(count).encode_to_vec()).await?;
    for item in items {
        socket.send(item).await?;
    }
    socket.receive().await
}

/// Sends a request and decodes its reply as `M`.
pub async fn call<M: Message + Default>(
    socket: &FramedSocket,
    action: &str,
    items: &[Vec<u8>],
) -> Result<M, EnvError> {
    let reply = send_request(socket, action, items).await?;
    Ok(M::decode(reply.as_slice())?)
}

/// A request as far as it could be read.
enum Incoming {
    Request(Request),
    /// Framing was intact but the request itself is unusable
    Malformed(String),
}

/// Reads one complete request under the socket's processing lock.
///
/// Malformed requests are reported as [`EnvError::Protocol`].
pub async fn receive_request(socket: &FramedSocket) -> Result<Request, EnvError> {
    match read_request(socket).await? {
        Incoming::Request(request) => Ok(request),
        Incoming::Malformed(reason) => Err(EnvError::protocol(reason)),
    }
}

/// Reads every frame a request declares before judging it, so a bad request
/// leaves the socket positioned at the next one.
async fn read_request(socket: &FramedSocket) -> Result<Incoming, EnvError> {
    let _parsing = socket.lock_processing().await;

    let action = String::from_utf8(socket.receive().await?);
    let count = match Num::decode(socket.receive().await?.as_slice()) {
        Ok(count) => count.num,
        Err(e) => return Ok(Incoming::Malformed(format!("item count cannot be decoded: {}", e))),
    };
    let count = match count {
        NO_ITEMS => 0,
        n if n < 0 => return Ok(Incoming::Malformed(format!("invalid item count {}", n))),
        n => n as usize,
    };

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(socket.receive().await?);
    }
    Ok(match action {
        Ok(action) => Incoming::Request(Request { action, items }),
        Err(e) => Incoming::Malformed(format!("action is not UTF-8: {}", e)),
    })
}

/// Reads one request, runs the handler outside the processing lock and
/// sends its reply.
///
/// A malformed request is answered with a [`Void`](crate::proto::Void)
/// naming the problem instead of reaching the handler.
pub async fn process_request<H>(socket: &FramedSocket, handler: &H) -> Result<(), EnvError>
where
    H: RequestHandler + ?Sized,
{
    let reply = match read_request(socket).await? {
        Incoming::Request(request) => {
            debug!("<- {} {}", socket.peer(), request.action);
            handler.handle(&request.action, request.items).await
        }
        Incoming::Malformed(reason) => {
            warn!("Malformed request from {}: {}", socket.peer(), reason);
            Void::new(reason).encode_to_vec()
        }
    };
    socket.send(&reply).await
}

/// Serves requests until the peer goes away.
///
/// A closed connection is the normal end of a session and returns `Ok`.
/// Transport failures end the session with an error.
pub async fn process_requests<H>(socket: &FramedSocket, handler: &H) -> Result<(), EnvError>
where
    H: RequestHandler + ?Sized,
{
    loop {
        match process_request(socket, handler).await {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => {
                debug!("Connection {} closed, stop serving: {}", socket.peer(), e);
                return Ok(());
            }
            Err(e) => {
                warn!("Dropping connection {}: {}", socket.peer(), e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramingConfig;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Replies with "<action>:<item count>:<concatenated items>".
    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, action: &str, items: Vec<Vec<u8>>) -> Vec<u8> {
            let mut reply = format!("{}:{}:", action, items.len()).into_bytes();
            for item in items {
                reply.extend(item);
            }
            reply
        }
    }

    async fn socket_pair() -> (FramedSocket, Arc<FramedSocket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(
            FramedSocket::connect(addr, FramingConfig::default()),
            listener.accept()
        );
        let server = FramedSocket::new(accepted.unwrap().0, FramingConfig::default()).unwrap();
        (client.unwrap(), Arc::new(server))
    }

    fn serve(server: Arc<FramedSocket>) -> tokio::task::JoinHandle<Result<(), EnvError>> {
        tokio::spawn(async move { process_requests(&*server, &EchoHandler).await })
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (client, server) = socket_pair().await;
        serve(server);

        let reply = send_request(&client, "vids", &[b"ab".to_vec(), b"cd".to_vec()])
            .await
            .unwrap();
        assert_eq!(reply, b"vids:2:abcd");
    }

    #[tokio::test]
    async fn test_zero_items_use_sentinel() {
        let (client, server) = socket_pair().await;

        let sender = tokio::spawn(async move { send_request(&client, "generateSid", &[]).await });

        assert_eq!(server.receive().await.unwrap(), b"generateSid");
        let count = Num::decode(server.receive().await.unwrap().as_slice()).unwrap();
        assert_eq!(count.num, NO_ITEMS);
        server.send(b"ok").await.unwrap();

        assert_eq!(sender.await.unwrap().unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_call_decodes_reply() {
        struct VoidHandler;

        #[async_trait]
        impl RequestHandler for VoidHandler {
            async fn handle(&self, action: &str, _items: Vec<Vec<u8>>) -> Vec<u8> {
                Void::new(format!("handled {}", action)).encode_to_vec()
            }
        }

        let (client, server) = socket_pair().await;
        tokio::spawn(async move { process_requests(&*server, &VoidHandler).await });

        let reply: Void = call(&client, "stop", &[]).await.unwrap();
        assert_eq!(reply.message, "handled stop");
    }

    #[tokio::test]
    async fn test_serving_ends_quietly_on_close() {
        let (client, server) = socket_pair().await;
        let serving = serve(server);

        send_request(&client, "isRunning", &[]).await.unwrap();
        client.shutdown().await;
        drop(client);

        assert!(serving.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_malformed_requests_get_an_error_reply() {
        let (client, server) = socket_pair().await;
        let serving = serve(server);

        client.send(b"steps").await.unwrap();
        client.send(&Num::new(-5).encode_to_vec()).await.unwrap();
        let reply = Void::decode(client.receive().await.unwrap().as_slice()).unwrap();
        assert_eq!(reply.message, "invalid item count -5");

        // A non-UTF-8 action still has its items consumed
        client.send(&[0xff, 0xfe]).await.unwrap();
        client.send(&Num::new(1).encode_to_vec()).await.unwrap();
        client.send(b"item").await.unwrap();
        let reply = Void::decode(client.receive().await.unwrap().as_slice()).unwrap();
        assert!(reply.message.starts_with("action is not UTF-8"), "{}", reply.message);

        // The connection keeps serving
        let reply = send_request(&client, "vids", &[b"x".to_vec()]).await.unwrap();
        assert_eq!(reply, b"vids:1:x");
        assert!(!serving.is_finished());
    }

    #[tokio::test]
    async fn test_receive_request_reports_malformed_requests() {
        let (client, server) = socket_pair().await;

        client.send(b"steps").await.unwrap();
        client.send(&Num::new(-5).encode_to_vec()).await.unwrap();
        assert!(matches!(receive_request(&server).await, Err(EnvError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_shared_socket_replies_stay_paired() {
        let (client, server) = socket_pair().await;
        serve(server);
        let client = Arc::new(client);

        let mut handles = Vec::new();
        for i in 0..16 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let action = format!("action{}", i);
                let item = vec![i as u8; 100];
                let reply = send_request(&client, &action, &[item.clone()]).await.unwrap();
                let mut expected = format!("{}:1:", action).into_bytes();
                expected.extend(item);
                assert_eq!(reply, expected);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_distinct_sockets_do_not_interleave() {
        let mut handles = Vec::new();
        for i in 0..6 {
            let (client, server) = socket_pair().await;
            serve(server);
            handles.push(tokio::spawn(async move {
                for round in 0..10 {
                    let action = format!("node{}-round{}", i, round);
                    let reply = send_request(&client, &action, &[]).await.unwrap();
                    assert_eq!(reply, format!("{}:0:", action).into_bytes());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
