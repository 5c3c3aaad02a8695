//! 에러 코드 상수 정의
//!
//! 프레젠테이션 레이어에서 i18n 처리를 위해 에러 코드를 문자열로 반환합니다.

/// 제한 시간 안에 시계가 감지되지 않음
pub const ERR_DETECTION_TIMEOUT: &str = "ERR_DETECTION_TIMEOUT";

/// 두 개 이상의 시계가 동시에 연결됨
pub const ERR_AMBIGUOUS_VOLUME: &str = "ERR_AMBIGUOUS_VOLUME";

/// 장치 정보 파일을 읽지 못해 대체 프로필 사용 (치명적이지 않음)
pub const ERR_PROFILE_DEGRADED: &str = "ERR_PROFILE_DEGRADED";

/// 조건에 맞는 활동 파일 없음
pub const ERR_NO_MATCHING_FILES: &str = "ERR_NO_MATCHING_FILES";

/// 파일 복사 실패
pub const ERR_TRANSFER_FAILED: &str = "ERR_TRANSFER_FAILED";

/// SMTP 로그인 거부
pub const ERR_AUTH_REJECTED: &str = "ERR_AUTH_REJECTED";

/// SMTP 서버 연결 실패
pub const ERR_SMTP_CONNECT: &str = "ERR_SMTP_CONNECT";

/// 첨부 파일 용량 초과
pub const ERR_ATTACHMENT_TOO_LARGE: &str = "ERR_ATTACHMENT_TOO_LARGE";

/// 그 밖의 메일 전송 실패
pub const ERR_SEND_FAILED: &str = "ERR_SEND_FAILED";

/// 파일 선택 취소
pub const ERR_SELECTION_CANCELLED: &str = "ERR_SELECTION_CANCELLED";

/// 사용자가 실행을 취소함
pub const ERR_CANCELLED: &str = "ERR_CANCELLED";

/// 설정 파일 누락 또는 잘못된 입력
pub const ERR_CONFIG: &str = "ERR_CONFIG";

/// 이전 실행이 아직 끝나지 않음
pub const ERR_RUN_IN_PROGRESS: &str = "ERR_RUN_IN_PROGRESS";

/// 허용되지 않은 상태 전이
pub const ERR_INVALID_TRANSITION: &str = "ERR_INVALID_TRANSITION";

/// 파일 시스템 오류
pub const ERR_IO: &str = "ERR_IO";

/// 작업 스레드가 비정상 종료됨
pub const ERR_TASK_FAILED: &str = "ERR_TASK_FAILED";
