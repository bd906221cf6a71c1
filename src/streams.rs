use serde::Serialize;
use tracing::{error, info};

use crate::remote::{RemoteCaller, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Camera {
    Face,
    LeftEye,
    RightEye,
}

impl Camera {
    pub fn method(self) -> &'static str {
        match self {
            Camera::Face => "start_face_stream",
            Camera::LeftEye => "start_left_eye_stream",
            Camera::RightEye => "start_right_eye_stream",
        }
    }
}

/// Asks the backend to start one camera stream. Errors are logged and returned.
pub async fn start_stream(remote: &dyn RemoteCaller, camera: Camera) -> Result<(), RemoteError> {
    match remote.call(camera.method(), serde_json::json!({})).await {
        Ok(()) => {
            info!(?camera, "camera stream started");
            Ok(())
        }
        Err(e) => {
            error!(?camera, error = %e, "failed to start camera stream");
            Err(e)
        }
    }
}

pub async fn start_face_stream(remote: &dyn RemoteCaller) -> Result<(), RemoteError> {
    start_stream(remote, Camera::Face).await
}

pub async fn start_left_eye_stream(remote: &dyn RemoteCaller) -> Result<(), RemoteError> {
    start_stream(remote, Camera::LeftEye).await
}

pub async fn start_right_eye_stream(remote: &dyn RemoteCaller) -> Result<(), RemoteError> {
    start_stream(remote, Camera::RightEye).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{FakeRemote, Reply};

    #[tokio::test]
    async fn each_camera_uses_its_own_method() {
        let remote = FakeRemote::new(Reply::Accept);
        start_face_stream(&remote).await.unwrap();
        start_left_eye_stream(&remote).await.unwrap();
        start_right_eye_stream(&remote).await.unwrap();

        let methods: Vec<String> = remote.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(
            methods,
            vec![
                "start_face_stream",
                "start_left_eye_stream",
                "start_right_eye_stream"
            ]
        );
    }

    #[tokio::test]
    async fn failure_is_returned_to_caller() {
        let remote = FakeRemote::new(Reply::Reject("no stream ip".to_string()));
        let err = start_stream(&remote, Camera::LeftEye).await.unwrap_err();
        assert_eq!(err, RemoteError::failed("start_left_eye_stream", "no stream ip"));

        remote.set_reply(Reply::Accept);
        assert!(start_stream(&remote, Camera::LeftEye).await.is_ok());
    }
}
