use super::session::{relay_media_events, CloseReason, SessionState, ViewerSession};
use crate::error::SessionError;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use deskcast_protocol::SignalingMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let session_id = Uuid::new_v4();
        let sessions = state.sessions.clone();
        sessions.track_future(
            handle_socket(socket, state, session_id)
                .instrument(tracing::info_span!("viewer", session = %session_id)),
        )
    })
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: Uuid) {
    tracing::info!("Viewer {:?}", SessionState::Connected);

    let (mut sender, receiver) = socket.split();

    let parts = match state.engine.create_session(session_id).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("{}", SessionError::Create(e));
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let cancel = state.shutdown.child_token();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();

    // Outbound messages go through a queue so candidate relay never waits on inbound handling
    let writer = tokio::spawn(
        write_outbound(sender, outbound_rx, cancel.clone()).in_current_span(),
    );

    let events = tokio::spawn(
        relay_media_events(
            session_id,
            parts.events,
            outbound_tx.clone(),
            state.registry.clone(),
            cancel.clone(),
        )
        .in_current_span(),
    );

    let mut session = ViewerSession::new(
        session_id,
        parts.session,
        parts.sink,
        state.registry.clone(),
        outbound_tx,
        cancel,
        state.config.negotiation_timeout,
    );
    tracing::info!("Viewer {:?}", session.state());

    let mut inbound = text_frames(receiver);
    match session.run(&mut inbound).await {
        Ok(CloseReason::Disconnected) => tracing::info!("Viewer disconnected"),
        Ok(CloseReason::Cancelled) => tracing::info!("Session cancelled"),
        Err(e) => tracing::warn!("Session ended: {}", e),
    }

    session.close().await;
    drop(session);

    let (writer, events) = tokio::join!(writer, events);
    if let Err(e) = writer.and(events) {
        tracing::error!("Session task panicked: {}", e);
    }

    tracing::info!("Viewer {:?}", SessionState::Closed);
}

/// Text frames of the websocket until the viewer closes it.
///
/// Binary, ping and pong frames carry no signaling and are skipped.
fn text_frames(
    receiver: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, SessionError>> + Unpin {
    let frames = receiver
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(_) => None,
                Err(e) => Some(Err(SessionError::Transport(e))),
            })
        });

    Box::pin(frames)
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode {} message: {}", message.tag(), e);
                continue;
            }
        };

        if sender.send(Message::Text(text.into())).await.is_err() {
            tracing::debug!("Viewer socket closed while sending");
            cancel.cancel();
            break;
        }
    }

    // The viewer sees its channel close whatever ended the session
    let _ = sender.send(Message::Close(None)).await;
}
