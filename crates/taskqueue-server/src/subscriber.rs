//! TCP accept loop for the binary subscription protocol -- the thin shell
//! spec.md places out of core scope, mirroring the original's
//! `subscriber.Server.Serve`.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use taskqueue_wire::SubscriptionSession;

pub async fn serve(listener: TcpListener, session_factory: Arc<SubscriptionSession>, base_cancel: CancellationToken) {
    loop {
        let accept = tokio::select! {
            res = listener.accept() => res,
            _ = base_cancel.cancelled() => return,
        };

        let (socket, addr) = match accept {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "accept conn error");
                continue;
            }
        };

        tracing::debug!(ip = %addr, "new conn");

        let session = session_factory.clone();
        let cancel = base_cancel.child_token();
        tokio::spawn(async move { session.run(socket, cancel).await });
    }
}
